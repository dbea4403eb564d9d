//! C8 — the audio host loop: the fixed per-block sequence driven
//! from the real-time callback of whatever [`AudioDriver`] opens the
//! device. This module owns the T_A side of the command/event rings; it
//! never blocks, never allocates on the steady-state path, and never
//! locks anything the service thread (T_S) could also be holding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::handle::{leak_handle, take_handle};
use crate::protocol::{pop_command, push_event, Command, Event};
use crate::ringbuffer::{CommandRing, EventRing};
use crate::runtime::{ParameterRequestResult, PedalboardRuntime, RealtimePatchPropertyRequest, VuSubscription};
use crate::status::{HostStatus, StatusTracker, SysfsStatusSource, SystemStatusSource};

/// How long after activation an underrun is suppressed from the event
/// stream: device warm-up on most embedded audio stacks
/// produces a burst of early xruns that don't reflect steady-state load.
pub const UNDERRUN_GRACE_SECONDS: f32 = 15.0;

/// A single MIDI message as it arrives from the driver's input port,
/// already split into its three bytes (status, data1, data2).
pub type MidiMessage = (u8, u8, u8);

/// The real-time driver's side of the contract: sample rate and
/// channel counts for compiling a pedalboard against this device, plus
/// the counters [`AudioHostLoop`] folds into `Underrun`/status telemetry.
/// Opening and closing the device itself is external to this crate.
pub trait AudioDriver: Send {
    fn sample_rate(&self) -> f32;
    fn input_channel_count(&self) -> usize;
    fn output_channel_count(&self) -> usize;
    fn xrun_count(&self) -> u64;
    fn cpu_use(&self) -> f32;
}

/// A port to sample on a fixed interval and report back to T_S, mirroring
/// a VU subscription but for a single named control port instead of a
/// whole instance's audio levels.
#[derive(Debug, Clone)]
pub struct MonitorPortSubscription {
    pub instance_id: u64,
    pub port_symbol: String,
    pub update_interval_s: f32,
}

struct MonitorPortState {
    subscription: MonitorPortSubscription,
    waiting_for_ack: bool,
    elapsed_s: f32,
}

/// Drives one compiled pedalboard through its per-block lifecycle and
/// owns the T_A end of the command/event rings. Constructed once per
/// audio stream; `process_block` is called from the driver's real-time
/// callback, one call per period. `S` is the `get_status()` sysfs seam,
/// defaulted to the real sysfs reader; tests substitute a fixed source.
pub struct AudioHostLoop<D: AudioDriver, S: SystemStatusSource = SysfsStatusSource> {
    driver: D,
    runtime: Option<PedalboardRuntime>,
    commands_in: Arc<CommandRing>,
    events_out: Arc<EventRing>,
    vu_subscriptions: Vec<VuSubscription>,
    vu_waiting_for_ack: bool,
    monitor_ports: Vec<MonitorPortState>,
    activated_at: Option<Instant>,
    last_seen_xruns: u64,
    completed_requests: HashMap<u64, ParameterRequestResult>,
    stopped: bool,
    status: StatusTracker<S>,
}

impl<D: AudioDriver> AudioHostLoop<D, SysfsStatusSource> {
    pub fn new(driver: D, commands_in: Arc<CommandRing>, events_out: Arc<EventRing>) -> Self {
        Self::with_status_source(driver, commands_in, events_out, SysfsStatusSource::default())
    }
}

impl<D: AudioDriver, S: SystemStatusSource> AudioHostLoop<D, S> {
    pub fn with_status_source(driver: D, commands_in: Arc<CommandRing>, events_out: Arc<EventRing>, status_source: S) -> Self {
        Self {
            driver,
            runtime: None,
            commands_in,
            events_out,
            vu_subscriptions: Vec::new(),
            vu_waiting_for_ack: false,
            monitor_ports: Vec::new(),
            activated_at: None,
            last_seen_xruns: 0,
            completed_requests: HashMap::new(),
            stopped: false,
            status: StatusTracker::new(status_source),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Snapshot for the service layer's `get_status()` call: underrun
    /// history from this loop's own tracking plus the sysfs-backed system
    /// readings, folded together with the driver's live CPU-use figure.
    pub fn status(&self) -> HostStatus {
        let active = self.activated_at.is_some() && !self.stopped;
        self.status.snapshot(self.driver.cpu_use(), active)
    }

    /// Installs the first pedalboard directly, bypassing the command ring.
    /// Used at stream start, before any client is attached to send a
    /// `ReplacePedalboard` command.
    pub fn install_initial_pedalboard(&mut self, runtime: PedalboardRuntime) {
        self.runtime = Some(runtime);
    }

    pub fn activate(&mut self) {
        self.activated_at = Some(Instant::now());
        self.last_seen_xruns = self.driver.xrun_count();
        if let Some(runtime) = &mut self.runtime {
            runtime.activate();
        }
    }

    pub fn deactivate(&mut self) {
        if let Some(runtime) = &mut self.runtime {
            runtime.deactivate();
        }
        self.stopped = true;
        let _ = push_event(&self.events_out, &Event::AudioStopped);
    }

    /// Drains a parameter-request result once T_S has observed its
    /// matching `ParameterRequestComplete` event. Returns `None` if the
    /// request hasn't resolved yet or was already taken.
    pub fn take_completed_request(&mut self, request_handle: u64) -> Option<ParameterRequestResult> {
        self.completed_requests.remove(&request_handle)
    }

    /// Runs the full sequence for one period: drain commands, dispatch
    /// MIDI, run the pedalboard, post VU/monitor telemetry under ack-gated
    /// flow control, and apply the post-activation underrun grace period.
    pub fn process_block(&mut self, driver_in: &[&[f32]], driver_out: &mut [&mut [f32]], frames: usize, midi_in: &[MidiMessage]) {
        if self.stopped {
            for ch in driver_out.iter_mut() {
                ch[..frames].fill(0.0);
            }
            return;
        }

        while let Some(cmd) = pop_command(&self.commands_in) {
            self.apply_command(cmd);
        }

        if let Some(runtime) = &mut self.runtime {
            for &(status, data1, data2) in midi_in {
                runtime.dispatch_midi(status, data1, data2, &self.events_out);
            }
        }

        match &mut self.runtime {
            Some(runtime) => runtime.run(driver_in, driver_out, frames, &self.events_out),
            None => {
                for ch in driver_out.iter_mut() {
                    ch[..frames].fill(0.0);
                }
            }
        }

        if let Some(runtime) = &mut self.runtime {
            for result in runtime.process_parameter_requests(frames as u32) {
                let handle = result.request_handle;
                self.completed_requests.insert(handle, result);
                let _ = push_event(&self.events_out, &Event::ParameterRequestComplete { request_handle: handle });
            }
        }

        self.post_vu_telemetry(frames, driver_in, driver_out);
        self.post_monitor_port_telemetry(frames);
        self.check_underrun_grace();
    }

    fn post_vu_telemetry(&mut self, frames: usize, driver_in: &[&[f32]], driver_out: &mut [&mut [f32]]) {
        if self.vu_subscriptions.is_empty() || self.vu_waiting_for_ack {
            return;
        }
        let Some(runtime) = &self.runtime else { return };
        let driver_out_ro: Vec<&[f32]> = driver_out.iter().map(|ch| &ch[..frames]).collect();
        let updates = runtime.compute_vus(&self.vu_subscriptions, frames, driver_in, &driver_out_ro);
        let handle = leak_handle(updates);
        if push_event(&self.events_out, &Event::SendVuUpdate { snapshot_handle: handle }) {
            self.vu_waiting_for_ack = true;
        } else {
            // Ring was full; reclaim the snapshot rather than leak it.
            let _ = unsafe { take_handle::<Vec<crate::runtime::VuUpdate>>(handle) };
        }
    }

    fn post_monitor_port_telemetry(&mut self, frames: usize) {
        let Some(runtime) = &self.runtime else { return };
        let dt = frames as f32 / self.driver.sample_rate();
        for (index, state) in self.monitor_ports.iter_mut().enumerate() {
            state.elapsed_s += dt;
            if state.waiting_for_ack || state.elapsed_s < state.subscription.update_interval_s {
                continue;
            }
            let value = runtime
            .instance_control_value(state.subscription.instance_id, &state.subscription.port_symbol)
            .unwrap_or(0.0);
            let handle = index as u64;
            if push_event(&self.events_out, &Event::SendMonitorPortUpdate { handle, value }) {
                state.waiting_for_ack = true;
                state.elapsed_s = 0.0;
            }
        }
    }

    fn check_underrun_grace(&mut self) {
        let xruns = self.driver.xrun_count();
        let new_xruns = xruns.saturating_sub(self.last_seen_xruns);
        if new_xruns > 0 {
            self.status.record_underrun(new_xruns);
        }

        let Some(activated_at) = self.activated_at else {
            self.last_seen_xruns = xruns;
            return;
        };
        if activated_at.elapsed().as_secs_f32() < UNDERRUN_GRACE_SECONDS {
            self.last_seen_xruns = xruns;
            return;
        }
        if new_xruns > 0 {
            let _ = push_event(&self.events_out, &Event::Underrun { count: new_xruns });
        }
        self.last_seen_xruns = xruns;
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::ReplacePedalboard { runtime_handle } => {
                let new_runtime: PedalboardRuntime = unsafe { take_handle(runtime_handle) };
                let old = self.runtime.replace(new_runtime);
                if let Some(mut runtime) = old {
                    runtime.deactivate();
                    let old_handle = leak_handle(runtime);
                    let _ = push_event(&self.events_out, &Event::PedalboardReplaced { old_runtime_handle: old_handle });
                }
                if let Some(runtime) = &mut self.runtime {
                    runtime.activate();
                }
            }
            Command::SetControl { effect_index, control_index, value } => {
                if let Some(runtime) = &mut self.runtime {
                    runtime.set_control_by_index(effect_index, control_index, value);
                }
            }
            Command::SetBypass { effect_index, enabled } => {
                if let Some(runtime) = &mut self.runtime {
                    runtime.set_bypass_by_index(effect_index, enabled);
                }
            }
            Command::SetInputVolume { db } => {
                if let Some(runtime) = &mut self.runtime {
                    runtime.set_input_volume(db);
                }
            }
            Command::SetOutputVolume { db } => {
                if let Some(runtime) = &mut self.runtime {
                    runtime.set_output_volume(db);
                }
            }
            Command::SetVuSubscriptions { config_handle } => {
                self.vu_subscriptions = unsafe { take_handle(config_handle) };
                self.vu_waiting_for_ack = false;
            }
            Command::FreeVuSubscriptions { config_handle } => {
                let _ = unsafe { take_handle::<Vec<VuSubscription>>(config_handle) };
            }
            Command::SetMonitorPortSubscription { list_handle } => {
                let subs: Vec<MonitorPortSubscription> = unsafe { take_handle(list_handle) };
                self.monitor_ports = subs
                .into_iter()
                .map(|subscription| MonitorPortState { subscription, waiting_for_ack: false, elapsed_s: 0.0 })
                .collect();
            }
            Command::FreeMonitorPortSubscription { list_handle } => {
                let _ = unsafe { take_handle::<Vec<MonitorPortSubscription>>(list_handle) };
            }
            Command::AckVuUpdate => {
                self.vu_waiting_for_ack = false;
            }
            Command::AckMonitorPortUpdate { handle } => {
                if let Some(state) = self.monitor_ports.get_mut(handle as usize) {
                    state.waiting_for_ack = false;
                }
            }
            Command::ParameterRequest { request_handle } => {
                let request: RealtimePatchPropertyRequest = unsafe { take_handle(request_handle) };
                if let Some(runtime) = &mut self.runtime {
                    runtime.submit_parameter_request(request);
                }
            }
            Command::MidiProgramChange { .. } | Command::NextMidiProgram { .. } => {
                // Preset/bank navigation lives in the filesystem-backed
                // preset layer above this crate; this engine has no
                // concept of a preset to change to.
                log::debug!("midi program-change command received with no preset layer attached, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, HostConfig, LoadedPlugin, PluginLoader};
    use crate::pedalboard::Pedalboard;
    use crate::testing::PassthroughPlugin;
    use crate::worker::HostWorkerThread;

    struct FakeDriver {
        sample_rate: f32,
        xruns: u64,
    }

    impl AudioDriver for FakeDriver {
        fn sample_rate(&self) -> f32 {
            self.sample_rate
        }
        fn input_channel_count(&self) -> usize {
            1
        }
        fn output_channel_count(&self) -> usize {
            2
        }
        fn xrun_count(&self) -> u64 {
            self.xruns
        }
        fn cpu_use(&self) -> f32 {
            0.1
        }
    }

    struct FixedLoader;
    impl PluginLoader for FixedLoader {
        fn instantiate(&self, _uri: &str, _sample_rate: f32) -> Result<LoadedPlugin, String> {
            Ok(LoadedPlugin { runtime: Box::new(PassthroughPlugin::new(1, 1)), worker_task: None })
        }
    }

    fn build_loop() -> AudioHostLoop<FakeDriver> {
        let worker = HostWorkerThread::start(4096);
        let config = HostConfig::default();
        let pedalboard = Pedalboard::new("s1");
        let runtime = compile(&pedalboard, &FixedLoader, &worker, &config, 1, 2, None).expect("compiles");
        worker.shutdown();

        let commands = Arc::new(CommandRing::new(4096, false));
        let events = Arc::new(EventRing::new(4096, false));
        let mut host = AudioHostLoop::new(FakeDriver { sample_rate: 48_000.0, xruns: 0 }, commands, events);
        host.install_initial_pedalboard(runtime);
        host.activate();
        host
    }

    #[test]
    fn empty_pedalboard_runs_a_block_without_panicking() {
        let mut host = build_loop();
        let input = vec![0.5f32; 16];
        let mut left = vec![0.0f32; 16];
        let mut right = vec![0.0f32; 16];
        let driver_in: Vec<&[f32]> = vec![&input];
        {
            let mut driver_out: Vec<&mut [f32]> = vec![&mut left, &mut right];
            host.process_block(&driver_in, &mut driver_out, 16, &[]);
        }
        assert_eq!(left, input);
        assert_eq!(right, input);
    }

    #[test]
    fn deactivate_emits_audio_stopped_and_zeros_future_blocks() {
        let mut host = build_loop();
        host.deactivate();
        let input = vec![1.0f32; 8];
        let mut left = vec![1.0f32; 8];
        let mut right = vec![1.0f32; 8];
        let driver_in: Vec<&[f32]> = vec![&input];
        {
            let mut driver_out: Vec<&mut [f32]> = vec![&mut left, &mut right];
            host.process_block(&driver_in, &mut driver_out, 8, &[]);
        }
        assert!(left.iter().all(|&s| s == 0.0));
        let mut found_stopped = false;
        while let Some(ev) = crate::protocol::pop_event(&host.events_out) {
            if matches!(ev, Event::AudioStopped) {
                found_stopped = true;
            }
        }
        assert!(found_stopped);
    }

    #[test]
    fn vu_subscription_waits_for_ack_before_posting_again() {
        let mut host = build_loop();
        host.vu_subscriptions = vec![VuSubscription { instance_id: crate::pedalboard::INPUT_VOLUME_INSTANCE_ID }];

        let input = vec![0.25f32; 8];
        let mut left = vec![0.0f32; 8];
        let mut right = vec![0.0f32; 8];
        let driver_in: Vec<&[f32]> = vec![&input];
        {
            let mut driver_out: Vec<&mut [f32]> = vec![&mut left, &mut right];
            host.process_block(&driver_in, &mut driver_out, 8, &[]);
        }
        assert!(host.vu_waiting_for_ack);

        let mut snapshot_handles = Vec::new();
        while let Some(ev) = crate::protocol::pop_event(&host.events_out) {
            if let Event::SendVuUpdate { snapshot_handle } = ev {
                snapshot_handles.push(snapshot_handle);
            }
        }
        assert_eq!(snapshot_handles.len(), 1);
        let _: Vec<crate::runtime::VuUpdate> = unsafe { take_handle(snapshot_handles[0]) };

        {
            let mut driver_out: Vec<&mut [f32]> = vec![&mut left, &mut right];
            host.process_block(&driver_in, &mut driver_out, 8, &[]);
        }
        let has_second_update = {
            let mut found = false;
            while let Some(ev) = crate::protocol::pop_event(&host.events_out) {
                if matches!(ev, Event::SendVuUpdate { .. }) {
                    found = true;
                }
            }
            found
        };
        assert!(!has_second_update, "no second VU snapshot should be posted before the first is acked");
    }

    #[test]
    fn underrun_is_folded_into_status_even_while_the_event_is_grace_suppressed() {
        use std::sync::atomic::{AtomicU64, Ordering};

        struct BumpableDriver {
            xruns: Arc<AtomicU64>,
        }
        impl AudioDriver for BumpableDriver {
            fn sample_rate(&self) -> f32 {
                48_000.0
            }
            fn input_channel_count(&self) -> usize {
                1
            }
            fn output_channel_count(&self) -> usize {
                1
            }
            fn xrun_count(&self) -> u64 {
                self.xruns.load(Ordering::Relaxed)
            }
            fn cpu_use(&self) -> f32 {
                0.3
            }
        }

        struct NoSysfsSource;
        impl SystemStatusSource for NoSysfsSource {
            fn cpu_freq_min_hz(&self) -> Option<u64> {
                None
            }
            fn cpu_freq_max_hz(&self) -> Option<u64> {
                None
            }
            fn temperature_mc(&self) -> Option<i64> {
                None
            }
            fn governor(&self) -> Option<String> {
                None
            }
        }

        let worker = HostWorkerThread::start(4096);
        let config = HostConfig::default();
        let pedalboard = Pedalboard::new("status");
        let runtime = compile(&pedalboard, &FixedLoader, &worker, &config, 1, 1, None).expect("compiles");
        worker.shutdown();

        let commands = Arc::new(CommandRing::new(4096, false));
        let events = Arc::new(EventRing::new(4096, false));
        let xruns = Arc::new(AtomicU64::new(0));
        let driver = BumpableDriver { xruns: xruns.clone() };
        let mut host = AudioHostLoop::with_status_source(driver, commands, events, NoSysfsSource);
        host.install_initial_pedalboard(runtime);
        host.activate();

        xruns.fetch_add(2, Ordering::Relaxed);

        let input = vec![0.0f32; 8];
        let mut output = vec![0.0f32; 8];
        let driver_in: Vec<&[f32]> = vec![&input];
        {
            let mut driver_out: Vec<&mut [f32]> = vec![&mut output];
            host.process_block(&driver_in, &mut driver_out, 8, &[]);
        }

        let mut saw_event = false;
        while let Some(ev) = crate::protocol::pop_event(&host.events_out) {
            if matches!(ev, Event::Underrun { .. }) {
                saw_event = true;
            }
        }
        assert!(!saw_event, "underrun events are suppressed during the post-activation grace window");

        let status = host.status();
        assert_eq!(status.underruns, 2);
        assert!(status.ms_since_last_underrun.is_some());
        assert_eq!(status.cpu_use, 0.3);
        assert!(status.active);
    }
}
