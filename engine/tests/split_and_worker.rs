//! Integration coverage for the two collaborators `pedalboard_end_to_end.rs`
//! doesn't touch: an A/B split compiled through the full pipeline, and a
//! plugin's worker-interface request round-tripping through the shared
//! background thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stompframe_core::compiler::{compile, HostConfig, LoadedPlugin, PluginLoader};
use stompframe_core::pedalboard::{Pedalboard, PedalboardItem, PluginItem, SplitItem};
use stompframe_core::plugin::{PluginRuntime, RunContext};
use stompframe_core::port::{PortDirection, PortFlags, PortInfo, PortKind, Units};
use stompframe_core::ringbuffer::EventRing;
use stompframe_core::split::{Select, SplitType, CONTROL_SELECT};
use stompframe_core::testing::{EchoWorkerTask, GainPlugin, PassthroughPlugin};
use stompframe_core::worker::HostWorkerThread;

struct SplitLoader;
impl PluginLoader for SplitLoader {
    fn instantiate(&self, uri: &str, _sample_rate: f32) -> Result<LoadedPlugin, String> {
        let runtime: Box<dyn PluginRuntime> = if uri == "urn:test:gain" {
            Box::new(GainPlugin::new(-6.0))
        } else {
            Box::new(PassthroughPlugin::new(1, 1))
        };
        Ok(LoadedPlugin { runtime, worker_task: None })
    }
}

#[test]
fn ab_split_select_b_routes_only_the_bottom_chain_through_compile() {
    let mut pedalboard = Pedalboard::new("split-ab");
    let top_id = pedalboard.allocate_instance_id();
    let bottom_id = pedalboard.allocate_instance_id();
    let split_id = pedalboard.allocate_instance_id();

    pedalboard.items.push(PedalboardItem::Split(SplitItem {
        instance_id: split_id,
        split_type: SplitType::Ab,
        select: Select::B,
        mix: 0.0,
        pan_l: 0.0,
        pan_r: 0.0,
        vol_l_db: 0.0,
        vol_r_db: 0.0,
        top: vec![PedalboardItem::Plugin(PluginItem {
            instance_id: top_id,
            uri: "urn:test:gain".to_string(),
            enabled: true,
            controls: vec![],
            state: None,
            midi_bindings: vec![],
            path_properties: HashMap::new(),
        })],
        bottom: vec![PedalboardItem::Plugin(PluginItem {
            instance_id: bottom_id,
            uri: "urn:test:passthrough".to_string(),
            enabled: true,
            controls: vec![],
            state: None,
            midi_bindings: vec![],
            path_properties: HashMap::new(),
        })],
    }));

    let worker = HostWorkerThread::start(4096);
    let config = HostConfig::default();
    let mut runtime = compile(&pedalboard, &SplitLoader, &worker, &config, 1, 1, None).expect("split pedalboard compiles");
    worker.shutdown();
    runtime.activate();

    // Both branches' crossfade gains are snapped at construction (no ramp
    // on a freshly compiled split), so select=B should pass the bottom
    // chain straight through from the very first sample.
    let input = vec![1.0f32; 16];
    let input_refs: Vec<&[f32]> = vec![&input];
    let mut output = vec![0.0f32; 16];
    let events = EventRing::new(4096, false);
    {
        let mut out_refs: Vec<&mut [f32]> = vec![&mut output];
        runtime.run(&input_refs, &mut out_refs, 16, &events);
    }
    for &sample in &output {
        assert!((sample - 1.0).abs() < 1e-4, "select B should pass the passthrough branch through unattenuated, got {sample}");
    }
}

#[test]
fn live_select_change_on_a_compiled_split_ramps_instead_of_snapping() {
    let mut pedalboard = Pedalboard::new("split-ab-live");
    let top_id = pedalboard.allocate_instance_id();
    let bottom_id = pedalboard.allocate_instance_id();
    let split_id = pedalboard.allocate_instance_id();

    pedalboard.items.push(PedalboardItem::Split(SplitItem {
        instance_id: split_id,
        split_type: SplitType::Ab,
        select: Select::A,
        mix: 0.0,
        pan_l: 0.0,
        pan_r: 0.0,
        vol_l_db: 0.0,
        vol_r_db: 0.0,
        top: vec![PedalboardItem::Plugin(PluginItem {
            instance_id: top_id,
            uri: "urn:test:gain".to_string(),
            enabled: true,
            controls: vec![],
            state: None,
            midi_bindings: vec![],
            path_properties: HashMap::new(),
        })],
        bottom: vec![PedalboardItem::Plugin(PluginItem {
            instance_id: bottom_id,
            uri: "urn:test:passthrough".to_string(),
            enabled: true,
            controls: vec![],
            state: None,
            midi_bindings: vec![],
            path_properties: HashMap::new(),
        })],
    }));

    let worker = HostWorkerThread::start(4096);
    let config = HostConfig::default();
    let mut runtime = compile(&pedalboard, &SplitLoader, &worker, &config, 1, 1, None).expect("split pedalboard compiles");
    worker.shutdown();
    runtime.activate();

    // Select A is snapped fully wet at construction; the -6 dB gain chain
    // is the only contributor, so the settled output sits at 10^(-6/20).
    let input = vec![1.0f32; 8];
    let input_refs: Vec<&[f32]> = vec![&input];
    let mut settled = vec![0.0f32; 8];
    let events = EventRing::new(4096, false);
    {
        let mut out_refs: Vec<&mut [f32]> = vec![&mut settled];
        runtime.run(&input_refs, &mut out_refs, 8, &events);
    }
    let select_a_level = 10f32.powf(-6.0 / 20.0);
    for &sample in &settled {
        assert!((sample - select_a_level).abs() < 1e-3, "select A should settle at the gain chain's output, got {sample}");
    }

    // The split is the first effect compiled (pushed before either
    // sub-chain), so its positional effect_index is 0.
    runtime.set_control_by_index(0, CONTROL_SELECT as u32, 1.0);

    // Right after the command lands the ramp has barely moved, nowhere
    // near either branch's steady-state level yet.
    let mut just_after = vec![0.0f32; 8];
    {
        let mut out_refs: Vec<&mut [f32]> = vec![&mut just_after];
        runtime.run(&input_refs, &mut out_refs, 8, &events);
    }
    assert!((just_after[0] - select_a_level).abs() < 0.05, "first block after retargeting should still be close to the old level, got {}", just_after[0]);
    assert!((just_after[0] - 1.0).abs() > 1e-3, "first block after retargeting must not have already snapped to the new level");

    // Run out the rest of the 0.1s transition (4800 samples at 48kHz) and
    // confirm it lands on the passthrough branch's unattenuated output.
    let remaining_frames = 4800usize.saturating_sub(8);
    let mut tail = vec![0.0f32; remaining_frames];
    let tail_in = vec![1.0f32; remaining_frames];
    let tail_in_refs: Vec<&[f32]> = vec![&tail_in];
    {
        let mut out_refs: Vec<&mut [f32]> = vec![&mut tail];
        runtime.run(&tail_in_refs, &mut out_refs, remaining_frames, &events);
    }
    for &sample in &tail[tail.len() - 8..] {
        assert!((sample - 1.0).abs() < 1e-3, "select B should have fully settled by the end of the transition, got {sample}");
    }
}

/// Generator-shaped plugin (one audio-out port, no audio-in) that schedules
/// one worker request on its first block and exposes whether the response
/// came back as a read-only control port, so the round trip is observable
/// through `PedalboardRuntime::instance_control_value` without any
/// downcast out of the compiled graph.
struct WorkerRoundTripPlugin {
    ports: Vec<PortInfo>,
    scheduled: bool,
    received: bool,
}

impl WorkerRoundTripPlugin {
    fn new() -> Self {
        let ports = vec![
            PortInfo {
                index: 0,
                symbol: "audio_out".to_string(),
                direction: PortDirection::Output,
                kind: PortKind::Audio,
                min_value: -1.0,
                max_value: 1.0,
                default_value: 0.0,
                flags: PortFlags::default(),
                scale_points: Vec::new(),
                units: Units::Unknown,
                is_bypass: false,
            },
            PortInfo {
                index: 1,
                symbol: "echo_received".to_string(),
                direction: PortDirection::Input,
                kind: PortKind::Control,
                min_value: 0.0,
                max_value: 1.0,
                default_value: 0.0,
                flags: PortFlags::default(),
                scale_points: Vec::new(),
                units: Units::Unknown,
                is_bypass: false,
            },
        ];
        Self { ports, scheduled: false, received: false }
    }
}

impl PluginRuntime for WorkerRoundTripPlugin {
    fn ports(&self) -> &[PortInfo] {
        &self.ports
    }
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    fn control_value(&self, index: usize) -> f32 {
        if index == 1 && self.received {
            1.0
        } else {
            0.0
        }
    }
    fn set_control(&mut self, _index: usize, _value: f32) {}

    fn run(&mut self, ctx: &mut RunContext<'_, '_, '_>) {
        if !self.scheduled {
            ctx.worker_requests.push(b"ping".to_vec());
            self.scheduled = true;
        }
        ctx.audio_out[0][..ctx.frames].fill(0.0);
    }

    fn has_worker(&self) -> bool {
        true
    }
    fn work(&mut self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
    fn work_response(&mut self, _data: &[u8]) {
        self.received = true;
    }
}

struct WorkerLoader;
impl PluginLoader for WorkerLoader {
    fn instantiate(&self, _uri: &str, _sample_rate: f32) -> Result<LoadedPlugin, String> {
        Ok(LoadedPlugin {
            runtime: Box::new(WorkerRoundTripPlugin::new()),
            worker_task: Some(Arc::new(EchoWorkerTask)),
        })
    }
}

#[test]
fn worker_request_round_trips_through_the_shared_thread_into_a_compiled_plugin() {
    let mut pedalboard = Pedalboard::new("worker-roundtrip");
    let id = pedalboard.push_plugin("urn:test:worker-echo", vec![]);

    let worker = HostWorkerThread::start(4096);
    let config = HostConfig::default();
    let mut runtime = compile(&pedalboard, &WorkerLoader, &worker, &config, 0, 1, None).expect("pedalboard compiles");
    runtime.activate();

    let events = EventRing::new(4096, false);
    let mut output = vec![0.0f32; 8];
    let mut received = false;
    for _ in 0..200 {
        {
            let mut out_refs: Vec<&mut [f32]> = vec![&mut output];
            runtime.run(&[], &mut out_refs, 8, &events);
        }
        if runtime.instance_control_value(id, "echo_received") == Some(1.0) {
            received = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(received, "worker response never made it back to the plugin");
    worker.shutdown();
}
