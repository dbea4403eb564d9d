//! Port metadata. Immutable once a plugin bundle has been discovered
//! externally; the core only ever reads these fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    Audio,
    Control,
    Atom,
    Cv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Units {
    Hz,
    Db,
    Ms,
    S,
    Semitone,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortFlags {
    pub toggled: bool,
    pub enumeration: bool,
    pub trigger: bool,
    pub momentary_on: bool,
    pub momentary_off: bool,
    pub supports_midi: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalePoint {
    pub label: String,
    pub value: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    pub index: u32,
    pub symbol: String,
    pub direction: PortDirection,
    pub kind: PortKind,
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
    pub flags: PortFlags,
    pub scale_points: Vec<ScalePoint>,
    pub units: Units,
    pub is_bypass: bool,
}

impl PortInfo {
    pub fn range_to_value(&self, normalized: f32) -> f32 {
        let normalized = normalized.clamp(0.0, 1.0);
        self.min_value + normalized * (self.max_value - self.min_value)
    }

    pub fn value_to_range(&self, value: f32) -> f32 {
        if (self.max_value - self.min_value).abs() < f32::EPSILON {
            return 0.0;
        }
        ((value - self.min_value) / (self.max_value - self.min_value)).clamp(0.0, 1.0)
    }
}

/// A `(symbol, value)` pair applied to a plugin instance at load time or by
/// a `SetControl` command once resolved to a control index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlValue {
    pub symbol: String,
    pub value: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port() -> PortInfo {
        PortInfo {
            index: 0,
            symbol: "gain".to_string(),
            direction: PortDirection::Input,
            kind: PortKind::Control,
            min_value: -60.0,
            max_value: 12.0,
            default_value: 0.0,
            flags: PortFlags::default(),
            scale_points: vec![],
            units: Units::Db,
            is_bypass: false,
        }
    }

    #[test]
    fn range_to_value_at_extremes() {
        let p = port();
        assert_eq!(p.range_to_value(0.0), -60.0);
        assert_eq!(p.range_to_value(1.0), 12.0);
    }

    #[test]
    fn value_to_range_round_trips_range_to_value() {
        let p = port();
        for n in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let v = p.range_to_value(n);
            assert!((p.value_to_range(v) - n).abs() < 1e-5);
        }
    }
}
