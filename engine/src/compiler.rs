//! C5 compile half: walks the declarative graph and turns it into a
//! flat process-action list plus a pre-allocated buffer pool. The execution
//! half — `PedalboardRuntime::run` and friends — lives in
//! [`crate::runtime`]; this module only builds the static description.
//!
//! A real bundle loader (LV2 discovery, `dlopen`) is an external
//! collaborator; `PluginLoader` is the narrow seam the compiler needs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::effect::EffectNode;
use crate::error::CompileError;
use crate::midi::{control_change_key, note_on_key, MappingType, MidiMapping, ToggleMode};
use crate::pedalboard::{MidiBinding, MidiSource, Pedalboard, PedalboardItem, PluginItem, SplitItem};
use crate::plugin::{PluginInstance, PluginRuntime};
use crate::port::{PortDirection, PortKind};
use crate::runtime::PedalboardRuntime;
use crate::split::{SplitControls, SplitEffect, SplitType};
use crate::worker::{HostWorkerThread, Worker, WorkerTask};

/// Construction-time knobs threaded through `compile`, collected into one
/// plain struct instead of a pile of free-standing globals.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub sample_rate: f32,
    pub max_block_size: usize,
    pub atom_buffer_size: usize,
    pub command_ring_capacity: usize,
    pub event_ring_capacity: usize,
    pub worker_request_ring_capacity: usize,
    pub worker_reply_ring_capacity: usize,
    pub lock_memory: bool,
    pub underrun_grace_seconds: f32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            max_block_size: 4096,
            atom_buffer_size: 8192,
            command_ring_capacity: 64 * 1024,
            event_ring_capacity: 64 * 1024,
            worker_request_ring_capacity: 16 * 1024,
            worker_reply_ring_capacity: 16 * 1024,
            lock_memory: true,
            underrun_grace_seconds: 15.0,
        }
    }
}

/// What a loader hands back for one plugin URI: the audio-thread-owned
/// runtime and, separately, a worker-capable handle if the plugin declares
/// the worker interface. These are two views onto the same underlying
/// native plugin (per the LV2 worker extension, `run` and `work` may
/// execute concurrently and the plugin itself is responsible for
/// thread-safety between them) — kept as two distinct Rust objects rather
/// than one shared-and-locked one, so `run` never takes a lock on T_A.
pub struct LoadedPlugin {
    pub runtime: Box<dyn PluginRuntime>,
    pub worker_task: Option<Arc<dyn WorkerTask>>,
}

pub trait PluginLoader {
    fn instantiate(&self, uri: &str, sample_rate: f32) -> Result<LoadedPlugin, String>;

    fn name_for(&self, uri: &str) -> String {
        uri.to_string()
    }
}

/// One step of the per-block execution list.
/// Buffer indices reference slots in `PedalboardRuntime`'s buffer pool.
pub enum ProcessAction {
    Run { effect_index: usize, in_buffers: Vec<usize>, out_buffers: Vec<usize> },
    PreMix { effect_index: usize, in_buffers: Vec<usize>, top_in_buffers: Vec<usize>, bottom_in_buffers: Vec<usize> },
    PostMix { effect_index: usize, top_out_buffers: Vec<usize>, bottom_out_buffers: Vec<usize>, out_buffers: Vec<usize> },
}

struct BufferPool {
    buffers: Vec<Vec<f32>>,
    max_block_size: usize,
}

impl BufferPool {
    fn new(max_block_size: usize) -> Self {
        Self { buffers: Vec::new(), max_block_size }
    }

    fn alloc(&mut self, n: usize) -> Vec<usize> {
        (0..n)
        .map(|_| {
                let index = self.buffers.len();
                self.buffers.push(vec![0.0; self.max_block_size]);
                index
        })
        .collect()
    }
}

/// Routes a chain's buffer indices onto a plugin's declared channel count:
/// identity when counts match, left-only when collapsing stereo into mono,
/// fan-out when spreading mono into stereo, and a best-effort index clamp
/// for any other mismatch.
fn route_channels(buffers: &[usize], n_needed: usize) -> Vec<usize> {
    if buffers.is_empty() || n_needed == 0 {
        return Vec::new();
    }
    if buffers.len() == n_needed {
        buffers.to_vec()
    } else if n_needed == 1 {
        vec![buffers[0]]
    } else if buffers.len() == 1 {
        vec![buffers[0]; n_needed]
    } else {
        (0..n_needed).map(|i| buffers[i.min(buffers.len() - 1)]).collect()
    }
}

fn collect_midi_bindings(items: &[PedalboardItem], out: &mut Vec<(u64, Vec<MidiBinding>)>) {
    for item in items {
        match item {
            PedalboardItem::Plugin(p) => {
                if !p.midi_bindings.is_empty() {
                    out.push((p.instance_id, p.midi_bindings.clone()));
                }
            }
            PedalboardItem::Split(s) => {
                collect_midi_bindings(&s.top, out);
                collect_midi_bindings(&s.bottom, out);
            }
            PedalboardItem::Empty { .. } => {}
        }
    }
}

struct Compiler<'a> {
    loader: &'a dyn PluginLoader,
    worker_thread: &'a Arc<HostWorkerThread>,
    config: &'a HostConfig,
    pool: BufferPool,
    effects: Vec<EffectNode>,
    actions: Vec<ProcessAction>,
    instance_effect_index: HashMap<u64, usize>,
    /// Per-effect `(audio_in, audio_out)` buffer indices, keyed by effect
    /// index — feeds `ComputeVus`. For a split these are the
    /// chain-level buffers entering PreMix and leaving PostMix, not the
    /// sub-chain interiors.
    effect_channel_buffers: HashMap<usize, (Vec<usize>, Vec<usize>)>,
    midi_mappings: Vec<MidiMapping>,
    existing: HashMap<u64, EffectNode>,
}

impl<'a> Compiler<'a> {
    fn compile_chain(&mut self, items: &[PedalboardItem], in_buffers: Vec<usize>) -> Result<Vec<usize>, CompileError> {
        let mut current = in_buffers;
        for item in items {
            current = self.compile_item(item, current)?;
        }
        Ok(current)
    }

    fn compile_item(&mut self, item: &PedalboardItem, in_buffers: Vec<usize>) -> Result<Vec<usize>, CompileError> {
        match item {
            PedalboardItem::Empty { .. } => Ok(in_buffers),
            PedalboardItem::Plugin(p) => self.compile_plugin(p, in_buffers),
            PedalboardItem::Split(s) => self.compile_split(s, in_buffers),
        }
    }

    fn compile_plugin(&mut self, item: &PluginItem, in_buffers: Vec<usize>) -> Result<Vec<usize>, CompileError> {
        let effect_index = if let Some(node) = self.existing.remove(&item.instance_id) {
            self.effects.push(node);
            self.effects.len() - 1
        } else {
            let loaded =
            self.loader.instantiate(&item.uri, self.config.sample_rate).map_err(|reason| CompileError::PluginLoadFailed {
                    uri: item.uri.clone(),
                    name: self.loader.name_for(&item.uri),
                    reason,
            })?;
            let worker: Option<Worker> = loaded
            .worker_task
            .map(|task| self.worker_thread.register(task, self.config.worker_reply_ring_capacity));

            let mut instance = PluginInstance::construct(
                item.instance_id,
                &item.uri,
                &self.loader.name_for(&item.uri),
                loaded.runtime,
                &item.controls,
                self.config.sample_rate,
                self.config.atom_buffer_size,
                worker,
            )?;

            if let Some(state) = &item.state {
                if let Err(err) = instance.restore_state(state) {
                    log::warn!("instance {}: state restore failed: {err}", item.instance_id);
                }
            }
            instance.set_bypass(!item.enabled);

            self.effects.push(EffectNode::Lv2Plugin(instance));
            self.effects.len() - 1
        };

        self.instance_effect_index.insert(item.instance_id, effect_index);

        let (n_in, n_out) = {
            let plugin = self.effects[effect_index].as_plugin().expect("just inserted a plugin node");
            (plugin.n_audio_in(), plugin.n_audio_out())
        };

        let routed_in = route_channels(&in_buffers, n_in);
        let out_buffers = self.pool.alloc(n_out);

        self.actions.push(ProcessAction::Run {
                effect_index,
                in_buffers: routed_in.clone(),
                out_buffers: out_buffers.clone(),
        });
        self.effect_channel_buffers.insert(effect_index, (routed_in, out_buffers.clone()));

        Ok(out_buffers)
    }

    fn compile_split(&mut self, item: &SplitItem, in_buffers: Vec<usize>) -> Result<Vec<usize>, CompileError> {
        let controls = SplitControls {
            split_type: item.split_type,
            select: item.select,
            mix: item.mix,
            pan_l: item.pan_l,
            pan_r: item.pan_r,
            vol_l_db: item.vol_l_db,
            vol_r_db: item.vol_r_db,
        };
        let split = SplitEffect::new(item.instance_id, self.config.sample_rate, controls);
        self.effects.push(EffectNode::Split(split));
        let effect_index = self.effects.len() - 1;
        self.instance_effect_index.insert(item.instance_id, effect_index);

        let (top_in, bottom_in) = match item.split_type {
            SplitType::Lr => (self.pool.alloc(1), self.pool.alloc(1)),
            SplitType::Ab | SplitType::Mix => {
                let n = in_buffers.len().max(1);
                (self.pool.alloc(n), self.pool.alloc(n))
            }
        };

        self.actions.push(ProcessAction::PreMix {
                effect_index,
                in_buffers: in_buffers.clone(),
                top_in_buffers: top_in.clone(),
                bottom_in_buffers: bottom_in.clone(),
        });

        let top_out = self.compile_chain(&item.top, top_in)?;
        let bottom_out = self.compile_chain(&item.bottom, bottom_in)?;

        // Force-stereo for an explicit L/R split regardless of what the
        // sub-chains produced; otherwise take the wider side.
        let out_channels = match item.split_type {
            SplitType::Lr => 2,
            _ => top_out.len().max(bottom_out.len()).max(1),
        };
        let out_buffers = self.pool.alloc(out_channels);

        self.actions.push(ProcessAction::PostMix {
                effect_index,
                top_out_buffers: top_out,
                bottom_out_buffers: bottom_out,
                out_buffers: out_buffers.clone(),
        });
        self.effect_channel_buffers.insert(effect_index, (in_buffers, out_buffers.clone()));

        Ok(out_buffers)
    }

    fn compile_midi_map(&mut self, bindings: Vec<(u64, Vec<MidiBinding>)>) -> Result<(), CompileError> {
        for (instance_id, plugin_bindings) in bindings {
            let effect_index = *self
            .instance_effect_index
            .get(&instance_id)
            .ok_or_else(|| CompileError::GraphInvariantViolated(format!("midi binding references unknown instance {instance_id}")))?;
            let plugin = self.effects[effect_index]
            .as_plugin()
            .ok_or_else(|| CompileError::GraphInvariantViolated(format!("midi binding targets non-plugin instance {instance_id}")))?;

            for binding in &plugin_bindings {
                let found = plugin
                .ports()
                .iter()
                .enumerate()
                .find(|(_, p)| p.symbol == binding.control_symbol && p.kind == PortKind::Control && p.direction == PortDirection::Input);
                let Some((control_index, port)) = found else {
                    log::warn!("midi binding for unknown control '{}' on instance {instance_id}", binding.control_symbol);
                    continue;
                };

                let key = match binding.source {
                    MidiSource::Note(n) => note_on_key(n),
                    MidiSource::ControlChange(cc) => control_change_key(cc),
                };
                let mapping_type = if port.flags.momentary_on || port.flags.momentary_off {
                    MappingType::MomentarySwitch
                } else if port.flags.trigger {
                    MappingType::Trigger { rising_edge_only: matches!(binding.source, MidiSource::Note(_)) }
                } else if port.flags.toggled {
                    MappingType::Toggle(ToggleMode::OnRisingEdge)
                } else if port.flags.enumeration {
                    MappingType::Select
                } else {
                    MappingType::Dial
                };

                let min = binding.min_override.unwrap_or(port.min_value);
                let max = binding.max_override.unwrap_or(port.max_value);
                self.midi_mappings
                .push(MidiMapping::new(key, binding.channel, instance_id, control_index, mapping_type, min, max, port.default_value));
            }
        }
        self.midi_mappings.sort_by_key(|m| m.key);
        Ok(())
    }
}

/// Compiles a declarative [`Pedalboard`] into a runnable [`PedalboardRuntime`].
/// `existing_effects`, when given, lets instances that are still
/// present in the new graph (same instance-id) carry their already-loaded
/// plugin state across a pedalboard swap instead of reconstructing from
/// scratch; anything left unclaimed is dropped by the caller, off the
/// audio thread.
pub fn compile(
    pedalboard: &Pedalboard,
    loader: &dyn PluginLoader,
    worker_thread: &Arc<HostWorkerThread>,
    config: &HostConfig,
    driver_input_channels: usize,
    driver_output_channels: usize,
    existing_effects: Option<HashMap<u64, EffectNode>>,
) -> Result<PedalboardRuntime, CompileError> {
    let mut compiler = Compiler {
        loader,
        worker_thread,
        config,
        pool: BufferPool::new(config.max_block_size),
        effects: Vec::new(),
        actions: Vec::new(),
        instance_effect_index: HashMap::new(),
        effect_channel_buffers: HashMap::new(),
        midi_mappings: Vec::new(),
        existing: existing_effects.unwrap_or_default(),
    };

    let input_buffers = compiler.pool.alloc(driver_input_channels.max(1));
    let chain_out = compiler.compile_chain(&pedalboard.items, input_buffers.clone())?;

    let output_buffers = if chain_out.len() == driver_output_channels {
        chain_out
    } else if chain_out.len() == 1 && driver_output_channels == 2 {
        vec![chain_out[0], chain_out[0]]
    } else {
        route_channels(&chain_out, driver_output_channels)
    };

    let mut bindings = Vec::new();
    collect_midi_bindings(&pedalboard.items, &mut bindings);
    compiler.compile_midi_map(bindings)?;

    Ok(PedalboardRuntime::from_compiled(
            compiler.effects,
            compiler.pool.buffers,
            compiler.actions,
            input_buffers,
            output_buffers,
            compiler.midi_mappings,
            compiler.effect_channel_buffers,
            pedalboard.input_volume_db,
            pedalboard.output_volume_db,
            config,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PassthroughPlugin;

    struct FixedLoader;
    impl PluginLoader for FixedLoader {
        fn instantiate(&self, _uri: &str, _sample_rate: f32) -> Result<LoadedPlugin, String> {
            Ok(LoadedPlugin { runtime: Box::new(PassthroughPlugin::new(1, 1)), worker_task: None })
        }
    }

    #[test]
    fn empty_pedalboard_mono_to_stereo_duplicates_the_channel() {
        let pedalboard = Pedalboard::new("empty");
        let worker = HostWorkerThread::start(4096);
        let config = HostConfig::default();
        let runtime = compile(&pedalboard, &FixedLoader, &worker, &config, 1, 2, None).unwrap();
        assert_eq!(runtime.output_buffer_count(), 2);
        worker.shutdown();
    }

    #[test]
    fn unknown_plugin_uri_surfaces_as_plugin_load_failed() {
        struct FailingLoader;
        impl PluginLoader for FailingLoader {
            fn instantiate(&self, _uri: &str, _sample_rate: f32) -> Result<LoadedPlugin, String> {
                Err("not found".to_string())
            }
        }
        let mut pedalboard = Pedalboard::new("test");
        pedalboard.push_plugin("urn:missing", vec![]);
        let worker = HostWorkerThread::start(4096);
        let config = HostConfig::default();
        let result = compile(&pedalboard, &FailingLoader, &worker, &config, 1, 1, None);
        assert!(matches!(result, Err(CompileError::PluginLoadFailed { .. })));
        worker.shutdown();
    }

    #[test]
    fn route_channels_fans_mono_out_to_stereo() {
        assert_eq!(route_channels(&[7], 2), vec![7, 7]);
        assert_eq!(route_channels(&[7, 8], 1), vec![7]);
        assert_eq!(route_channels(&[7, 8], 2), vec![7, 8]);
    }
}
