//! Tagged effect node: replaces subclass-based polymorphism between
//! "is a plugin" and "is a split" with a plain enum plus a narrow shared
//! capability surface. The pedalboard compiler (C5) only ever talks to
//! `EffectNode`, never to `PluginInstance`/`SplitEffect` directly.

use crate::error::PluginRuntimeError;
use crate::plugin::PluginInstance;
use crate::ringbuffer::EventRing;
use crate::split::SplitEffect;

pub enum EffectNode {
    Lv2Plugin(PluginInstance),
    Split(SplitEffect),
}

impl EffectNode {
    pub fn instance_id(&self) -> u64 {
        match self {
            EffectNode::Lv2Plugin(p) => p.instance_id,
            EffectNode::Split(s) => s.instance_id,
        }
    }

    pub fn activate(&mut self) {
        if let EffectNode::Lv2Plugin(p) = self {
            p.activate();
        }
    }

    pub fn deactivate(&mut self) {
        if let EffectNode::Lv2Plugin(p) = self {
            p.deactivate();
        }
    }

    pub fn set_control(&mut self, control_index: usize, value: f32) {
        match self {
            EffectNode::Lv2Plugin(p) => p.set_control(control_index, value),
            EffectNode::Split(s) => s.set_control(control_index, value),
        }
    }

    pub fn set_bypass(&mut self, enabled: bool) {
        if let EffectNode::Lv2Plugin(p) = self {
            p.set_bypass(enabled);
        }
    }

    pub fn run(&mut self, frames: usize, audio_in: &[&[f32]], audio_out: &mut [&mut [f32]], events_out: &EventRing) {
        if let EffectNode::Lv2Plugin(p) = self {
            p.run(frames, audio_in, audio_out, events_out);
        }
        // `Split` never appears behind a plain `run`: the compiler emits
        // its PreMix/PostMix actions directly against the `SplitEffect`
        // it owns, since a split needs two destination buffers, not one.
    }

    pub fn take_error(&mut self) -> Option<PluginRuntimeError> {
        match self {
            EffectNode::Lv2Plugin(p) => p.take_error(),
            EffectNode::Split(_) => None,
        }
    }

    pub fn as_plugin(&self) -> Option<&PluginInstance> {
        match self {
            EffectNode::Lv2Plugin(p) => Some(p),
            EffectNode::Split(_) => None,
        }
    }

    pub fn as_plugin_mut(&mut self) -> Option<&mut PluginInstance> {
        match self {
            EffectNode::Lv2Plugin(p) => Some(p),
            EffectNode::Split(_) => None,
        }
    }

    pub fn as_split_mut(&mut self) -> Option<&mut SplitEffect> {
        match self {
            EffectNode::Split(s) => Some(s),
            EffectNode::Lv2Plugin(_) => None,
        }
    }
}
