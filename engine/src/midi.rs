//! C7 — the MIDI mapping dispatcher. Runs from C8 after MIDI input has
//! been copied out of the driver's buffers, before C5's `Run`. The mapping
//! table is sorted ascending by key at compile time (C5) so dispatch here
//! is a binary search plus a linear scan of same-key neighbors, with
//! strict real-time cost.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToggleMode {
    OnRisingEdge,
    OnValue,
    Flip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingType {
    Trigger { rising_edge_only: bool },
    Toggle(ToggleMode),
    MomentarySwitch,
    Select,
    Dial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MidiMapping {
    pub key: u16,
    pub channel: Option<u8>,
    pub instance_id: u64,
    pub control_index: usize,
    pub mapping_type: MappingType,
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
    last_value: u8,
    toggle_state: bool,
    last_output: Option<f32>,
}

impl MidiMapping {
    pub fn new(
        key: u16,
        channel: Option<u8>,
        instance_id: u64,
        control_index: usize,
        mapping_type: MappingType,
        min_value: f32,
        max_value: f32,
        default_value: f32,
    ) -> Self {
        Self {
            key,
            channel,
            instance_id,
            control_index,
            mapping_type,
            min_value,
            max_value,
            default_value,
            last_value: 0,
            toggle_state: false,
            last_output: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiDispatchResult {
    pub instance_id: u64,
    pub control_index: usize,
    pub value: f32,
    /// Whether to emit `MidiValueChanged` for this update.
    pub notify: bool,
}

pub fn note_on_key(note: u8) -> u16 {
    0x9000 | note as u16
}

pub fn control_change_key(cc: u8) -> u16 {
    0xB000 | cc as u16
}

fn normalize(status: u8, data1: u8, data2: u8) -> (u8, u8, u8) {
    if status & 0xF0 == 0x80 {
        (0x90 | (status & 0x0F), data1, 0)
    } else {
        (status, data1, data2)
    }
}

/// Applies one raw data byte (velocity or CC value) to a single mapping,
/// returning the resulting control update if this event should fire one.
/// `Trigger`/`MomentarySwitch` never request a `MidiValueChanged`
/// notification; `Toggle`/`Select`/`Dial` request one only when the
/// computed value actually changed from the last dispatch.
fn apply(mapping: &mut MidiMapping, value_byte: u8) -> Option<MidiDispatchResult> {
    let instance_id = mapping.instance_id;
    let control_index = mapping.control_index;

    match mapping.mapping_type {
        MappingType::Trigger { rising_edge_only } => {
            let rising = value_byte != 0 && mapping.last_value == 0;
            mapping.last_value = value_byte;
            if rising_edge_only && !rising {
                return None;
            }
            let value = if mapping.default_value == mapping.max_value {
                mapping.min_value
            } else {
                mapping.max_value
            };
            Some(MidiDispatchResult { instance_id, control_index, value, notify: false })
        }
        MappingType::MomentarySwitch => {
            mapping.last_value = value_byte;
            let value = if value_byte != 0 { mapping.max_value } else { mapping.min_value };
            Some(MidiDispatchResult { instance_id, control_index, value, notify: false })
        }
        MappingType::Toggle(mode) => {
            let rising = value_byte != 0 && mapping.last_value == 0;
            mapping.last_value = value_byte;
            let value = match mode {
                ToggleMode::OnRisingEdge | ToggleMode::Flip => {
                    if matches!(mode, ToggleMode::Flip) || rising {
                        mapping.toggle_state = !mapping.toggle_state;
                    }
                    if mapping.toggle_state {
                        mapping.max_value
                    } else {
                        mapping.min_value
                    }
                }
                ToggleMode::OnValue => {
                    let normalized = (value_byte as f32 / 127.0).clamp(0.0, 1.0);
                    mapping.toggle_state = value_byte != 0;
                    mapping.min_value + normalized * (mapping.max_value - mapping.min_value)
                }
            };
            let notify = mapping.last_output != Some(value);
            mapping.last_output = Some(value);
            Some(MidiDispatchResult { instance_id, control_index, value, notify })
        }
        MappingType::Select | MappingType::Dial => {
            mapping.last_value = value_byte;
            let normalized = (value_byte as f32 / 127.0).clamp(0.0, 1.0);
            let value = mapping.min_value + normalized * (mapping.max_value - mapping.min_value);
            let notify = mapping.last_output != Some(value);
            mapping.last_output = Some(value);
            Some(MidiDispatchResult { instance_id, control_index, value, notify })
        }
    }
}

/// Dispatches one raw MIDI message (status, data1, data2) against a sorted
/// mapping table, binary-searching for the lowest matching index and
/// visiting every entry that shares the key, skipping non-matching
/// channels. `mappings` must already be sorted ascending by `key`.
pub fn dispatch(mappings: &mut [MidiMapping], status: u8, data1: u8, data2: u8) -> Vec<MidiDispatchResult> {
    let (status, data1, data2) = normalize(status, data1, data2);
    let key = ((status & 0xF0) as u16) << 8 | data1 as u16;
    let channel = status & 0x0F;

    let start = mappings.partition_point(|m| m.key < key);
    let mut results = Vec::new();
    let mut idx = start;
    while idx < mappings.len() && mappings[idx].key == key {
        let matches_channel = mappings[idx].channel.map(|c| c == channel).unwrap_or(true);
        if matches_channel {
            if let Some(result) = apply(&mut mappings[idx], data2) {
                results.push(result);
            }
        }
        idx += 1;
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(key: u16, mapping_type: MappingType) -> MidiMapping {
        MidiMapping::new(key, None, 1, 0, mapping_type, -60.0, 12.0, 0.0)
    }

    #[test]
    fn binary_search_visits_every_matching_key_and_skips_others() {
        let mut mappings = vec![
            mapping(control_change_key(6), MappingType::Dial),
            mapping(control_change_key(7), MappingType::Dial),
            mapping(control_change_key(7), MappingType::Select),
            mapping(control_change_key(8), MappingType::Dial),
        ];
        mappings.sort_by_key(|m| m.key);

        let results = dispatch(&mut mappings, 0xB0, 7, 127);
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.control_index, 0);
        }
    }

    #[test]
    fn cc7_dial_maps_full_velocity_to_max_value() {
        let mut mappings = vec![mapping(control_change_key(7), MappingType::Dial)];
        let results = dispatch(&mut mappings, 0xB0, 7, 127);
        assert_eq!(results.len(), 1);
        assert!((results[0].value - 12.0).abs() < 1e-4);
        assert!(results[0].notify);
    }

    #[test]
    fn momentary_switch_never_notifies() {
        let mut mappings = vec![mapping(note_on_key(60), MappingType::MomentarySwitch)];
        let results = dispatch(&mut mappings, 0x90, 60, 127);
        assert_eq!(results.len(), 1);
        assert!(!results[0].notify);
        assert_eq!(results[0].value, 12.0);
    }

    #[test]
    fn note_off_normalizes_to_note_on_velocity_zero() {
        let mut mappings = vec![mapping(note_on_key(60), MappingType::MomentarySwitch)];
        let results = dispatch(&mut mappings, 0x80, 60, 64);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].value, -60.0);
    }

    #[test]
    fn toggle_flips_on_rising_edge_only() {
        let mut mappings = vec![mapping(note_on_key(60), MappingType::Toggle(ToggleMode::OnRisingEdge))];
        let r1 = dispatch(&mut mappings, 0x90, 60, 127);
        assert_eq!(r1[0].value, 12.0);
        // A second message while still held (velocity != 0, last was != 0
        // too) is not a rising edge and must not flip again.
        mappings[0].last_value = 127;
        let r2 = dispatch(&mut mappings, 0x90, 60, 127);
        assert!(r2.is_empty() || r2[0].value == 12.0);
    }
}
