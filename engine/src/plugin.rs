//! C3 — the plugin instance wrapper: lifecycle, buffer-size adaptation,
//! the soft-bypass mixer, and per-instance error reporting.
//!
//! `PluginRuntime` is the narrow contract every loaded plugin must satisfy;
//! `PluginInstance` is the host-owned wrapper around one
//! `Box<dyn PluginRuntime>` that drives it per block.
//! Real bundle loading (LV2 discovery, `dlopen`, the URID/options/worker
//! feature list) is an external collaborator — the core only needs
//! something that satisfies this trait, which is exactly how the test
//! fakes in [`crate::testing`] stand in for it.

use crate::atom::SequenceForge;
use crate::dezipper::Dezipper;
use crate::error::{CompileError, PluginRuntimeError};
use crate::port::{ControlValue, PortDirection, PortInfo, PortKind};
use crate::protocol::{push_event, Event};
use crate::ringbuffer::EventRing;
use crate::worker::Worker;

pub const DEFAULT_BYPASS_TIME_S: f32 = 0.1;

/// Frame passed to [`PluginRuntime::run`]; borrows the host's buffers for
/// exactly the duration of the call.
pub struct RunContext<'a, 'i, 'o> {
    pub frames: usize,
    pub audio_in: &'a [&'i [f32]],
    pub audio_out: &'a mut [&'o mut [f32]],
    pub atom_in: &'a SequenceForge,
    pub atom_out: &'a mut SequenceForge,
    /// Work payloads the plugin wants scheduled on the shared worker
    /// thread this block; drained by the instance wrapper after `run`.
    pub worker_requests: &'a mut Vec<Vec<u8>>,
}

/// The narrow, in-process plugin contract. A real LV2 adapter and the
/// in-process test fakes both implement this.
pub trait PluginRuntime: Send {
    fn ports(&self) -> &[PortInfo];
    fn activate(&mut self);
    fn deactivate(&mut self);
    fn control_value(&self, index: usize) -> f32;
    fn set_control(&mut self, index: usize, value: f32);
    fn run(&mut self, ctx: &mut RunContext<'_, '_, '_>);

    fn min_block_length(&self) -> Option<u32> {
        None
    }
    fn max_block_length(&self) -> Option<u32> {
        None
    }
    fn power_of_2_block_length(&self) -> bool {
        false
    }

    fn has_worker(&self) -> bool {
        false
    }
    /// Runs on the worker thread (T_W), never on T_A.
    fn work(&mut self, data: &[u8]) -> Vec<u8> {
        let _ = data;
        Vec::new()
    }
    fn work_response(&mut self, data: &[u8]) {
        let _ = data;
    }

    fn save_state(&self) -> Option<Vec<u8>> {
        None
    }
    fn restore_state(&mut self, blob: &[u8]) -> Result<(), PluginRuntimeError> {
        let _ = blob;
        Ok(())
    }

    /// Takes and clears a captured `Error`-severity log message, if any.
    /// Warning/info/debug go straight to the host logger and never pass
    /// through here.
    fn take_log_error(&mut self) -> Option<String> {
        None
    }

    /// True once this block's `run` mutated persistent state.
    fn take_state_changed(&mut self) -> bool {
        false
    }

    fn is_generator(&self) -> bool {
        self.ports()
        .iter()
        .all(|p| p.kind != crate::port::PortKind::Audio || p.direction != PortDirection::Input)
    }
}

fn compute_fixed_block_size(
    uri: &str,
    min: Option<u32>,
    max: Option<u32>,
    pow2: bool,
) -> Result<u32, CompileError> {
    let lo = min.unwrap_or(1).max(1);
    let hi = max.unwrap_or(u32::MAX);
    let candidate = if pow2 { lo.next_power_of_two() } else { lo };
    if candidate < lo || candidate > hi {
        return Err(CompileError::UnsatisfiableBlockLength {
                uri: uri.to_string(),
                min: lo,
                max: hi,
                pow2,
        });
    }
    Ok(candidate)
}

/// Crossfades a plugin's processed output against the host's crossfade
/// input — the soft-bypass mixer. Built on [`Dezipper`] since both
/// are the same first-order slew, just with a shorter default transition.
pub struct BypassMixer {
    dezipper: Dezipper,
}

impl BypassMixer {
    pub fn new(sample_rate: f32, bypass_time_s: f32, initially_bypassed: bool) -> Self {
        let initial = if initially_bypassed { 0.0 } else { 1.0 };
        Self {
            dezipper: Dezipper::new(sample_rate, initial).with_transition_seconds(bypass_time_s),
        }
    }

    /// `enabled == true` means bypassed (dry); matches `SetBypass(enabled)`.
    pub fn set_bypass(&mut self, enabled: bool) {
        self.dezipper.set_target_linear(if enabled { 0.0 } else { 1.0 });
    }

    pub fn snap(&mut self, enabled: bool) {
        self.dezipper.snap_to(if enabled { 0.0 } else { 1.0 });
    }

    pub fn is_settled(&self) -> bool {
        self.dezipper.is_settled()
    }

    pub fn mix(&mut self, plugin_out: f32, input: f32) -> f32 {
        let current = self.dezipper.tick();
        current * plugin_out + (1.0 - current) * input
    }
}

/// Cross-mixes a generator's output against the chain's input signal with a
/// triangular curve. The exact curve shape is not specified; this
/// implementation ramps the dry signal out and the wet signal in
/// symmetrically around the midpoint, recorded as an open-question
/// resolution in DESIGN.md.
fn triangular_cross_mix(plugin_out: f32, input: f32, zero_input_mix: f32) -> f32 {
    let zero_input_mix = zero_input_mix.clamp(0.0, 1.0);
    let wet_gain = (2.0 * zero_input_mix).min(1.0);
    let dry_gain = (2.0 * (1.0 - zero_input_mix)).min(1.0);
    plugin_out * wet_gain + input * dry_gain
}

/// Per-channel staging buffers driving a plugin through a fixed internal
/// block size `B` regardless of the host's block size.
struct BufferStager {
    block_size: usize,
    stage_in: Vec<Vec<f32>>,
    stage_out: Vec<Vec<f32>>,
    stage_in_ix: usize,
    stage_out_ix: usize,
    stage_atom_in: SequenceForge,
    stage_atom_out: SequenceForge,
}

impl BufferStager {
    fn new(block_size: usize, n_in: usize, n_out: usize, atom_capacity: usize) -> Self {
        // The +1 sentinel frame is spare capacity for a debug-build overrun
        // guard, kept here rather than as a separate debug_assert-only
        // region, which would need unsafe to express.
        let padded = block_size + 1;
        Self {
            block_size,
            stage_in: vec![vec![0.0; padded]; n_in],
            stage_out: vec![vec![0.0; padded]; n_out],
            stage_in_ix: 0,
            stage_out_ix: block_size, // starts "empty": nothing staged to drain
            stage_atom_in: SequenceForge::new(atom_capacity),
            stage_atom_out: SequenceForge::new(atom_capacity),
        }
    }
}

pub struct PluginInstance {
    pub instance_id: u64,
    pub uri: String,
    pub name: String,
    runtime: Box<dyn PluginRuntime>,
    bypass: BypassMixer,
    bypass_requested: bool,
    stager: Option<BufferStager>,
    atom_in: SequenceForge,
    atom_out: SequenceForge,
    trigger_indices: Vec<usize>,
    default_control_values: Vec<(usize, f32)>,
    bypass_control_index: Option<usize>,
    zero_input_mix: f32,
    worker: Option<Worker>,
    error: Option<PluginRuntimeError>,
    n_audio_in: usize,
    n_audio_out: usize,
}

impl PluginInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn construct(
        instance_id: u64,
        uri: &str,
        name: &str,
        mut runtime: Box<dyn PluginRuntime>,
        controls: &[ControlValue],
        sample_rate: f32,
        atom_buffer_size: usize,
        worker: Option<Worker>,
    ) -> Result<Self, CompileError> {
        let min = runtime.min_block_length();
        let max = runtime.max_block_length();
        let pow2 = runtime.power_of_2_block_length();
        let needs_adaptation = min.is_some() || max.is_some() || pow2;

        let stager = if needs_adaptation {
            let block_size = compute_fixed_block_size(uri, min, max, pow2)? as usize;
            let n_in = runtime
            .ports()
            .iter()
            .filter(|p| p.kind == PortKind::Audio && p.direction == PortDirection::Input)
            .count();
            let n_out = runtime
            .ports()
            .iter()
            .filter(|p| p.kind == PortKind::Audio && p.direction == PortDirection::Output)
            .count();
            Some(BufferStager::new(block_size, n_in, n_out, atom_buffer_size))
        } else {
            None
        };

        for cv in controls {
            if let Some(index) = runtime
            .ports()
            .iter()
            .position(|p| p.symbol == cv.symbol && p.kind == PortKind::Control && p.direction == PortDirection::Input)
            {
                runtime.set_control(index, cv.value);
            }
            // Unknown symbols are ignored at load.
        }

        let trigger_indices = runtime
        .ports()
        .iter()
        .enumerate()
        .filter(|(_, p)| p.flags.trigger && p.direction == PortDirection::Input)
        .map(|(i, _)| i)
        .collect();

        let default_control_values = runtime
        .ports()
        .iter()
        .enumerate()
        .filter(|(_, p)| p.kind == PortKind::Control && p.direction == PortDirection::Input)
        .map(|(i, p)| (i, p.default_value))
        .collect();

        let bypass_control_index = runtime.ports().iter().position(|p| p.is_bypass);

        let n_audio_in = runtime
        .ports()
        .iter()
        .filter(|p| p.kind == PortKind::Audio && p.direction == PortDirection::Input)
        .count();
        let n_audio_out = runtime
        .ports()
        .iter()
        .filter(|p| p.kind == PortKind::Audio && p.direction == PortDirection::Output)
        .count();

        Ok(Self {
                instance_id,
                uri: uri.to_string(),
                name: name.to_string(),
                runtime,
                bypass: BypassMixer::new(sample_rate, DEFAULT_BYPASS_TIME_S, false),
                bypass_requested: false,
                stager,
                atom_in: SequenceForge::new(atom_buffer_size),
                atom_out: SequenceForge::new(atom_buffer_size),
                trigger_indices,
                default_control_values,
                bypass_control_index,
                zero_input_mix: 1.0,
                worker,
                error: None,
                n_audio_in,
                n_audio_out,
        })
    }

    pub fn activate(&mut self) {
        self.runtime.activate();
        self.bypass.snap(self.bypass_requested);
    }

    pub fn deactivate(&mut self) {
        self.runtime.deactivate();
        if let Some(worker) = &self.worker {
            worker.close();
        }
    }

    pub fn set_control(&mut self, index: usize, value: f32) {
        self.runtime.set_control(index, value);
        if Some(index) == self.bypass_control_index {
            self.set_bypass(value != 0.0);
        }
    }

    pub fn set_bypass(&mut self, enabled: bool) {
        self.bypass_requested = enabled;
        self.bypass.set_bypass(enabled);
    }

    pub fn take_error(&mut self) -> Option<PluginRuntimeError> {
        self.error.take()
    }

    pub fn n_audio_in(&self) -> usize {
        self.n_audio_in
    }

    pub fn n_audio_out(&self) -> usize {
        self.n_audio_out
    }

    pub fn ports(&self) -> &[PortInfo] {
        self.runtime.ports()
    }

    pub fn control_value(&self, index: usize) -> f32 {
        self.runtime.control_value(index)
    }

    pub fn control_index(&self, symbol: &str) -> Option<usize> {
        self.runtime
        .ports()
        .iter()
        .position(|p| p.symbol == symbol && p.kind == PortKind::Control && p.direction == PortDirection::Input)
    }

    pub fn save_state(&self) -> Option<Vec<u8>> {
        self.runtime.save_state()
    }

    /// Restores persisted state at construction time ("state restore
    /// errors"). Failures never fail the compile — the plugin keeps running
    /// with its already-applied default/port-loaded values, and the error
    /// is captured for `take_error` to relay as an `Lv2ErrorMessage`.
    pub fn restore_state(&mut self, blob: &[u8]) -> Result<(), PluginRuntimeError> {
        match self.runtime.restore_state(blob) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    fn run_once(&mut self, frames: usize, audio_in: &[&[f32]], audio_out: &mut [&mut [f32]]) {
        self.atom_out.clear();
        let mut worker_requests = Vec::new();
        {
            let mut ctx = RunContext {
                frames,
                audio_in,
                audio_out,
                atom_in: &self.atom_in,
                atom_out: &mut self.atom_out,
                worker_requests: &mut worker_requests,
            };
            self.runtime.run(&mut ctx);
        }
        if let Some(worker) = &self.worker {
            for payload in worker_requests {
                if !worker.schedule_work(&payload) {
                    log::warn!("instance {}: worker request dropped, queue full", self.instance_id);
                }
            }
        }
    }

    fn run_staged(&mut self, frames: usize, audio_in: &[&[f32]], audio_out: &mut [&mut [f32]]) {
        let stager = self.stager.as_mut().expect("run_staged without a stager");
        let block_size = stager.block_size;
        let mut produced = 0usize;

        while produced < frames {
            // 1. Drain staged output.
            let available = block_size - stager.stage_out_ix;
            let take = available.min(frames - produced);
            for (ch, out_ch) in audio_out.iter_mut().enumerate() {
                if ch >= stager.stage_out.len() {
                    continue;
                }
                out_ch[produced..produced + take]
                .copy_from_slice(&stager.stage_out[ch][stager.stage_out_ix..stager.stage_out_ix + take]);
            }
            stager.stage_out_ix += take;
            produced += take;

            // 2. Host output buffer full: stop.
            if produced >= frames {
                break;
            }

            // 3. Fill staged input.
            let space = block_size - stager.stage_in_ix;
            let fill = space.min(frames - produced);
            for (ch, in_ch) in audio_in.iter().enumerate() {
                if ch >= stager.stage_in.len() {
                    continue;
                }
                let src_start = produced;
                stager.stage_in[ch][stager.stage_in_ix..stager.stage_in_ix + fill]
                .copy_from_slice(&in_ch[src_start..src_start + fill]);
            }
            stager.stage_in_ix += fill;
            // We intentionally do not advance `produced` here: filling the
            // stage consumes host *input* samples, but host *output*
            // samples for this span were already zero and remain so until
            // the plugin actually runs; the next loop iteration's drain
            // step will pick them up once `stage_in_ix == block_size`.
            if fill == 0 && stager.stage_in_ix < block_size {
                // No host input left to offer and the stage isn't full:
                // nothing more can happen this host block.
                break;
            }

            // 4. Run the plugin once its stage is full.
            if stager.stage_in_ix == block_size {
                stager.stage_atom_in.clear();
                for event in self.atom_in.reader() {
                    stager.stage_atom_in.write_event(event.time_frames, event.type_urid, event.body);
                }
                stager.stage_atom_out.clear();

                let audio_in_slices: Vec<&[f32]> = stager.stage_in.iter().map(|v| &v[..block_size]).collect();
                let mut out_refs: Vec<&mut [f32]> =
                stager.stage_out.iter_mut().map(|v| &mut v[..block_size]).collect();
                let mut worker_requests = Vec::new();
                {
                    let mut ctx = RunContext {
                        frames: block_size,
                        audio_in: &audio_in_slices,
                        audio_out: &mut out_refs,
                        atom_in: &stager.stage_atom_in,
                        atom_out: &mut stager.stage_atom_out,
                        worker_requests: &mut worker_requests,
                    };
                    self.runtime.run(&mut ctx);
                }
                if let Some(worker) = &self.worker {
                    for payload in worker_requests {
                        worker.schedule_work(&payload);
                    }
                }

                self.atom_out.clear();
                for event in stager.stage_atom_out.reader() {
                    self.atom_out.write_event(event.time_frames, event.type_urid, event.body);
                }

                stager.stage_in_ix = 0;
                stager.stage_out_ix = 0;
            } else {
                // Stage not yet full and no more host input to give it
                // this call: stop, the remainder of the host block (if
                // any) is zero-filled by the caller.
                break;
            }
        }

        // Zero-fill anything the drain loop didn't reach.
        for out_ch in audio_out.iter_mut() {
            for sample in out_ch[produced..].iter_mut() {
                *sample = 0.0;
            }
        }
    }

    /// Runs this instance for `frames` samples. Soft-bypass
    /// and, for generators, the zero-input cross-mix are applied after the
    /// plugin produces its output. Relays atom output, state-changed
    /// notifications and captured errors onto `events_out`.
    pub fn run(&mut self, frames: usize, audio_in: &[&[f32]], audio_out: &mut [&mut [f32]], events_out: &EventRing) {
        self.atom_in.end_sequence();

        let is_generator = self.runtime.is_generator();
        let zero_input_mix = self.zero_input_mix;

        if self.stager.is_some() {
            self.run_staged(frames, audio_in, audio_out);
        } else {
            self.run_once(frames, audio_in, audio_out);
        }

        if let Some(worker) = &self.worker {
            worker.drain_responses(|bytes| self.runtime.work_response(bytes));
        }

        for (ch, out_ch) in audio_out.iter_mut().enumerate() {
            let in_ch = audio_in.get(ch.min(audio_in.len().saturating_sub(1))).copied().unwrap_or(&[]);
            for i in 0..frames {
                let plugin_out = out_ch[i];
                let input = in_ch.get(i).copied().unwrap_or(0.0);
                let pre_bypass = if is_generator {
                    triangular_cross_mix(plugin_out, input, zero_input_mix)
                } else {
                    plugin_out
                };
                out_ch[i] = self.bypass.mix(pre_bypass, input);
            }
        }

        for event in self.atom_out.reader() {
            let _ = push_event(
                events_out,
                &Event::AtomOutput {
                    instance_id: self.instance_id,
                    bytes: event.body.to_vec(),
                },
            );
        }
        if self.runtime.take_state_changed() {
            let _ = push_event(events_out, &Event::Lv2StateChanged { instance_id: self.instance_id });
        }

        if let Some(message) = self.runtime.take_log_error() {
            self.error = Some(PluginRuntimeError::Generic(message.clone()));
            let _ = push_event(
                events_out,
                &Event::Lv2ErrorMessage { instance_id: self.instance_id, text: message },
            );
        }

        for &index in &self.trigger_indices {
            if let Some((_, default)) = self.default_control_values.iter().find(|(i, _)| *i == index) {
                self.runtime.set_control(index, *default);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{GainPlugin, PassthroughPlugin};

    fn events() -> EventRing {
        EventRing::new(4096, false)
    }

    #[test]
    fn passthrough_instance_copies_input_to_output() {
        let mut instance = PluginInstance::construct(
            1,
            "urn:test:passthrough",
            "Passthrough",
            Box::new(PassthroughPlugin::new(1, 1)),
            &[],
            48_000.0,
            1024,
            None,
        )
        .unwrap();
        instance.activate();
        // Force the bypass mixer fully wet so the test observes the
        // plugin's own output, not a mid-ramp blend.
        instance.bypass.snap(false);

        let input = vec![0.5f32; 8];
        let input_refs: Vec<&[f32]> = vec![&input[..]];
        let mut output = vec![0.0f32; 8];
        {
            let mut output_refs: Vec<&mut [f32]> = vec![&mut output[..]];
            instance.run(8, &input_refs, &mut output_refs, &events());
        }
        assert_eq!(output, input);
    }

    #[test]
    fn bypass_idempotence_does_not_restart_ramp() {
        let mut instance = PluginInstance::construct(
            1,
            "urn:test:gain",
            "Gain",
            Box::new(GainPlugin::new(-6.0)),
            &[],
            48_000.0,
            1024,
            None,
        )
        .unwrap();
        instance.activate();
        instance.set_bypass(false);
        instance.set_bypass(false);
        assert!(instance.bypass.is_settled());
    }

    #[test]
    fn unsatisfiable_block_length_fails_construction() {
        let result = PluginInstance::construct(
            1,
            "urn:test:bad",
            "Bad",
            Box::new(PassthroughPlugin::new(1, 1).with_block_constraints(Some(100), Some(50), false)),
            &[],
            48_000.0,
            1024,
            None,
        );
        assert!(matches!(result, Err(CompileError::UnsatisfiableBlockLength { .. })));
    }
}
