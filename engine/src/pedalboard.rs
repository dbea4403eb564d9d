//! Data model: the declarative graph a user edits, before it is
//! compiled into a runnable [`crate::runtime::PedalboardRuntime`]. Nothing
//! here is audio-thread-facing; this is T_S/GUI-facing state, serializable
//! so a service layer external to this crate can persist it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::port::ControlValue;
use crate::split::{Select, SplitType};

/// MIDI source a binding reacts to, before sorting into a [`crate::midi::MidiMapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MidiSource {
    Note(u8),
    ControlChange(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiBinding {
    pub control_symbol: String,
    pub source: MidiSource,
    /// `None` matches any incoming channel.
    pub channel: Option<u8>,
    pub min_override: Option<f32>,
    pub max_override: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginItem {
    pub instance_id: u64,
    pub uri: String,
    pub enabled: bool,
    pub controls: Vec<ControlValue>,
    pub state: Option<Vec<u8>>,
    pub midi_bindings: Vec<MidiBinding>,
    pub path_properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitItem {
    pub instance_id: u64,
    pub split_type: SplitType,
    pub select: Select,
    pub mix: f32,
    pub pan_l: f32,
    pub pan_r: f32,
    pub vol_l_db: f32,
    pub vol_r_db: f32,
    pub top: Vec<PedalboardItem>,
    pub bottom: Vec<PedalboardItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PedalboardItem {
    Plugin(PluginItem),
    Empty { instance_id: u64 },
    Split(SplitItem),
}

impl PedalboardItem {
    pub fn instance_id(&self) -> u64 {
        match self {
            PedalboardItem::Plugin(p) => p.instance_id,
            PedalboardItem::Empty { instance_id } => *instance_id,
            PedalboardItem::Split(s) => s.instance_id,
        }
    }
}

/// Reserved instance-ids for the input/output volume VU nodes. Kept as
/// `u64` sentinels at the top of the id space rather than signed, since
/// every other instance-id is a plain monotonic counter starting at 0.
pub const INPUT_VOLUME_INSTANCE_ID: u64 = u64::MAX;
pub const OUTPUT_VOLUME_INSTANCE_ID: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pedalboard {
    pub name: String,
    pub items: Vec<PedalboardItem>,
    pub input_volume_db: f32,
    pub output_volume_db: f32,
    next_instance_id: u64,
}

impl Pedalboard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            input_volume_db: 0.0,
            output_volume_db: 0.0,
            next_instance_id: 0,
        }
    }

    /// Mints the next unique instance-id, skipping the two reserved VU
    /// sentinels (unreachable in practice since they sit at the top of the
    /// `u64` range, but made explicit rather than assumed).
    pub fn allocate_instance_id(&mut self) -> u64 {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        debug_assert!(id != INPUT_VOLUME_INSTANCE_ID && id != OUTPUT_VOLUME_INSTANCE_ID);
        id
    }

    pub fn push_empty(&mut self) -> u64 {
        let id = self.allocate_instance_id();
        self.items.push(PedalboardItem::Empty { instance_id: id });
        id
    }

    pub fn push_plugin(&mut self, uri: impl Into<String>, controls: Vec<ControlValue>) -> u64 {
        let id = self.allocate_instance_id();
        self.items.push(PedalboardItem::Plugin(PluginItem {
                    instance_id: id,
                    uri: uri.into(),
                    enabled: true,
                    controls,
                    state: None,
                    midi_bindings: Vec::new(),
                    path_properties: HashMap::new(),
        }));
        id
    }

    /// All instance-ids present anywhere in the graph, including nested
    /// split sub-chains — used by the compiler to validate MIDI bindings
    /// (invariant 6) and by the runtime to resolve `effect_index`.
    pub fn all_instance_ids(&self) -> Vec<u64> {
        fn walk(items: &[PedalboardItem], out: &mut Vec<u64>) {
            for item in items {
                out.push(item.instance_id());
                if let PedalboardItem::Split(s) = item {
                    walk(&s.top, out);
                    walk(&s.bottom, out);
                }
            }
        }
        let mut ids = Vec::new();
        walk(&self.items, &mut ids);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_unique_and_monotonic() {
        let mut pb = Pedalboard::new("test");
        let a = pb.push_empty();
        let b = pb.push_plugin("urn:test:gain", vec![]);
        assert_ne!(a, b);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn all_instance_ids_recurses_into_splits() {
        let mut pb = Pedalboard::new("test");
        let outer = pb.push_empty();
        let inner_id = pb.allocate_instance_id();
        let split_id = pb.allocate_instance_id();
        pb.items.push(PedalboardItem::Split(SplitItem {
                    instance_id: split_id,
                    split_type: SplitType::Mix,
                    select: Select::A,
                    mix: 0.0,
                    pan_l: 0.0,
                    pan_r: 0.0,
                    vol_l_db: 0.0,
                    vol_r_db: 0.0,
                    top: vec![PedalboardItem::Empty { instance_id: inner_id }],
                    bottom: vec![],
        }));

        let ids = pb.all_instance_ids();
        assert!(ids.contains(&outer));
        assert!(ids.contains(&inner_id));
    }
}
