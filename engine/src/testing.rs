//! In-process fake plugins standing in for real LV2 bundles in tests.
//! Plugin discovery from a filesystem bundle is out of scope for the
//! core, so everything here just implements [`crate::plugin::PluginRuntime`]
//! directly.

use std::f32::consts::PI;

use crate::plugin::{PluginRuntime, RunContext};
use crate::port::{PortDirection, PortFlags, PortInfo, PortKind, ScalePoint, Units};
use crate::worker::WorkerTask;

fn audio_port(index: u32, symbol: &str, direction: PortDirection) -> PortInfo {
    PortInfo {
        index,
        symbol: symbol.to_string(),
        direction,
        kind: PortKind::Audio,
        min_value: -1.0,
        max_value: 1.0,
        default_value: 0.0,
        flags: PortFlags::default(),
        scale_points: Vec::new(),
        units: Units::Unknown,
        is_bypass: false,
    }
}

fn control_port(index: u32, symbol: &str, min: f32, max: f32, default: f32, flags: PortFlags, units: Units) -> PortInfo {
    PortInfo {
        index,
        symbol: symbol.to_string(),
        direction: PortDirection::Input,
        kind: PortKind::Control,
        min_value: min,
        max_value: max,
        default_value: default,
        flags,
        scale_points: Vec::<ScalePoint>::new(),
        units,
        is_bypass: false,
    }
}

/// Copies its input straight to its output; used to exercise the bypass
/// mixer, buffer-size adaptation, and split neutrality tests without
/// needing any real signal processing.
pub struct PassthroughPlugin {
    ports: Vec<PortInfo>,
    min_block: Option<u32>,
    max_block: Option<u32>,
    pow2: bool,
}

impl PassthroughPlugin {
    pub fn new(n_in: usize, n_out: usize) -> Self {
        let mut ports = Vec::new();
        for i in 0..n_in {
            ports.push(audio_port(i as u32, &format!("audio_in_{i}"), PortDirection::Input));
        }
        for i in 0..n_out {
            ports.push(audio_port((n_in + i) as u32, &format!("audio_out_{i}"), PortDirection::Output));
        }
        Self { ports, min_block: None, max_block: None, pow2: false }
    }

    pub fn with_block_constraints(mut self, min: Option<u32>, max: Option<u32>, pow2: bool) -> Self {
        self.min_block = min;
        self.max_block = max;
        self.pow2 = pow2;
        self
    }
}

impl PluginRuntime for PassthroughPlugin {
    fn ports(&self) -> &[PortInfo] {
        &self.ports
    }
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn control_value(&self, _index: usize) -> f32 {
        0.0
    }
    fn set_control(&mut self, _index: usize, _value: f32) {}

    fn run(&mut self, ctx: &mut RunContext<'_, '_, '_>) {
        let n = ctx.audio_in.len().min(ctx.audio_out.len());
        for ch in 0..n {
            ctx.audio_out[ch][..ctx.frames].copy_from_slice(&ctx.audio_in[ch][..ctx.frames]);
        }
        for ch in n..ctx.audio_out.len() {
            ctx.audio_out[ch][..ctx.frames].fill(0.0);
        }
    }

    fn min_block_length(&self) -> Option<u32> {
        self.min_block
    }
    fn max_block_length(&self) -> Option<u32> {
        self.max_block
    }
    fn power_of_2_block_length(&self) -> bool {
        self.pow2
    }
}

/// A single-channel gain stage with one control port, `gain_db`.
pub struct GainPlugin {
    ports: Vec<PortInfo>,
    gain_db: f32,
}

impl GainPlugin {
    pub fn new(gain_db: f32) -> Self {
        let ports = vec![
            audio_port(0, "audio_in", PortDirection::Input),
            audio_port(1, "audio_out", PortDirection::Output),
            control_port(2, "gain_db", -60.0, 12.0, 0.0, PortFlags::default(), Units::Db),
        ];
        Self { ports, gain_db }
    }
}

impl PluginRuntime for GainPlugin {
    fn ports(&self) -> &[PortInfo] {
        &self.ports
    }
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn control_value(&self, index: usize) -> f32 {
        if index == 2 {
            self.gain_db
        } else {
            0.0
        }
    }
    fn set_control(&mut self, index: usize, value: f32) {
        if index == 2 {
            self.gain_db = value;
        }
    }

    fn run(&mut self, ctx: &mut RunContext<'_, '_, '_>) {
        let linear = if self.gain_db <= -60.0 { 0.0 } else { 10f32.powf(self.gain_db / 20.0) };
        for i in 0..ctx.frames {
            ctx.audio_out[0][i] = ctx.audio_in[0][i] * linear;
        }
    }
}

/// A zero-audio-input sine generator; exercises the generator cross-mix
/// path in the bypass mixer.
pub struct GeneratorPlugin {
    ports: Vec<PortInfo>,
    freq_hz: f32,
    sample_rate: f32,
    phase: f32,
}

impl GeneratorPlugin {
    pub fn new(freq_hz: f32, sample_rate: f32) -> Self {
        let ports = vec![audio_port(0, "audio_out", PortDirection::Output)];
        Self { ports, freq_hz, sample_rate, phase: 0.0 }
    }
}

impl PluginRuntime for GeneratorPlugin {
    fn ports(&self) -> &[PortInfo] {
        &self.ports
    }
    fn activate(&mut self) {
        self.phase = 0.0;
    }
    fn deactivate(&mut self) {}
    fn control_value(&self, _index: usize) -> f32 {
        0.0
    }
    fn set_control(&mut self, _index: usize, _value: f32) {}

    fn run(&mut self, ctx: &mut RunContext<'_, '_, '_>) {
        let step = 2.0 * PI * self.freq_hz / self.sample_rate;
        for i in 0..ctx.frames {
            ctx.audio_out[0][i] = self.phase.sin();
            self.phase += step;
            if self.phase > 2.0 * PI {
                self.phase -= 2.0 * PI;
            }
        }
    }
}

/// Echoes every worker request back verbatim; used to exercise the C6
/// round trip (S6).
#[derive(Default)]
pub struct WorkerEchoPlugin {
    ports: Vec<PortInfo>,
    pending_requests: Vec<Vec<u8>>,
}

impl WorkerEchoPlugin {
    pub fn new() -> Self {
        Self { ports: Vec::new(), pending_requests: Vec::new() }
    }

    /// Test hook: arms a work item to be scheduled on the next `run` call.
    pub fn queue_request(&mut self, payload: Vec<u8>) {
        self.pending_requests.push(payload);
    }
}

impl PluginRuntime for WorkerEchoPlugin {
    fn ports(&self) -> &[PortInfo] {
        &self.ports
    }
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn control_value(&self, _index: usize) -> f32 {
        0.0
    }
    fn set_control(&mut self, _index: usize, _value: f32) {}

    fn run(&mut self, ctx: &mut RunContext<'_, '_, '_>) {
        ctx.worker_requests.append(&mut self.pending_requests);
    }

    fn has_worker(&self) -> bool {
        true
    }

    fn work(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn work_response(&mut self, data: &[u8]) {
        log::trace!("WorkerEchoPlugin received {} byte response", data.len());
    }
}

/// The T_W-side counterpart to [`WorkerEchoPlugin`]: a real [`WorkerTask`]
/// so a [`crate::compiler::LoadedPlugin`] can exercise the shared worker
/// thread end to end in tests instead of only the in-process `work` path
/// on `PluginRuntime` that the real worker thread never calls directly.
pub struct EchoWorkerTask;

impl WorkerTask for EchoWorkerTask {
    fn work(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_has_matched_port_counts() {
        let p = PassthroughPlugin::new(2, 2);
        assert_eq!(p.ports().len(), 4);
    }

    #[test]
    fn gain_plugin_reports_its_control_value() {
        let p = GainPlugin::new(-6.0);
        assert_eq!(p.control_value(2), -6.0);
    }
}
