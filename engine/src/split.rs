//! C4 — the split effect: an internal pseudo-plugin fanning one chain into
//! two parallel sub-chains (`top`, `bottom`) and mixing the results back
//! together (A/B select, Mix, L/R).
//!
//! Modeled as a tagged capability alongside `Lv2Plugin` in [`crate::effect`]
//! rather than a subclass. `PreMix`/`PostMix` are the two process actions
//! the compiler (C5) emits for a split node, taking explicit buffer
//! slices from the pool rather than raw pointers.

use serde::{Deserialize, Serialize};

use crate::dezipper::{db_to_linear, Dezipper};

pub const MIX_TRANSITION_SECONDS: f32 = 0.1;

/// Numeric control indices a compiled split node accepts through
/// `EffectNode::set_control`/`set_control_by_index`, mirroring the
/// positional addressing a plugin's control ports use. `split_type` isn't
/// addressable here: it decides how many channels `PreMix` allocates for
/// each sub-chain, a structural choice fixed at compile time rather than
/// a live-ramped parameter.
pub const CONTROL_SELECT: usize = 0;
pub const CONTROL_MIX: usize = 1;
pub const CONTROL_PAN_L: usize = 2;
pub const CONTROL_PAN_R: usize = 3;
pub const CONTROL_VOL_L_DB: usize = 4;
pub const CONTROL_VOL_R_DB: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitType {
    Ab,
    Mix,
    Lr,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Select {
    A,
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitControls {
    pub split_type: SplitType,
    pub select: Select,
    pub mix: f32,
    pub pan_l: f32,
    pub pan_r: f32,
    pub vol_l_db: f32,
    pub vol_r_db: f32,
}

impl Default for SplitControls {
    fn default() -> Self {
        Self {
            split_type: SplitType::Ab,
            select: Select::A,
            mix: 0.0,
            pan_l: 0.0,
            pan_r: 0.0,
            vol_l_db: 0.0,
            vol_r_db: 0.0,
        }
    }
}

/// Linear pan law: `L = 1 - (pan+1)/2`, `R = (pan+1)/2`.
fn pan_law(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    (1.0 - (pan + 1.0) / 2.0, (pan + 1.0) / 2.0)
}

fn crossfade_gains(split_type: SplitType, select: Select, mix: f32) -> (f32, f32) {
    match split_type {
        SplitType::Lr => (1.0, 1.0), // PreMix already routed disjoint channels; no crossfade needed.
        SplitType::Ab => match select {
            Select::A => (1.0, 0.0),
            Select::B => (0.0, 1.0),
        },
        SplitType::Mix => {
            let mix = mix.clamp(-1.0, 1.0);
            ((1.0 - mix) / 2.0, (1.0 + mix) / 2.0)
        }
    }
}

pub struct SplitEffect {
    pub instance_id: u64,
    controls: SplitControls,
    top_gain: Dezipper,
    bottom_gain: Dezipper,
}

impl SplitEffect {
    pub fn new(instance_id: u64, sample_rate: f32, controls: SplitControls) -> Self {
        let (top_cross, bottom_cross) = crossfade_gains(controls.split_type, controls.select, controls.mix);
        let top_target = top_cross * db_to_linear(controls.vol_l_db);
        let bottom_target = bottom_cross * db_to_linear(controls.vol_r_db);

        let mut top_gain = Dezipper::new(sample_rate, top_target).with_transition_seconds(MIX_TRANSITION_SECONDS);
        let mut bottom_gain = Dezipper::new(sample_rate, bottom_target).with_transition_seconds(MIX_TRANSITION_SECONDS);
        top_gain.snap_to(top_target);
        bottom_gain.snap_to(bottom_target);

        Self { instance_id, controls, top_gain, bottom_gain }
    }

    pub fn controls(&self) -> SplitControls {
        self.controls
    }

    /// Re-targets the crossfade; never snaps, always ramps so the gain
    /// stays within [0,1] and monotonic while it's converging.
    pub fn set_controls(&mut self, controls: SplitControls) {
        self.controls = controls;
        let (top_cross, bottom_cross) = crossfade_gains(controls.split_type, controls.select, controls.mix);
        self.top_gain.set_target_linear(top_cross * db_to_linear(controls.vol_l_db));
        self.bottom_gain.set_target_linear(bottom_cross * db_to_linear(controls.vol_r_db));
    }

    pub fn is_settled(&self) -> bool {
        self.top_gain.is_settled() && self.bottom_gain.is_settled()
    }

    /// Applies one positionally-addressed control change, the live-update
    /// path `EffectNode::set_control` dispatches into. Unknown indices are
    /// ignored, the same tolerance a plugin's own `set_control` gives an
    /// out-of-range port index.
    pub fn set_control(&mut self, control_index: usize, value: f32) {
        let mut controls = self.controls;
        match control_index {
            CONTROL_SELECT => controls.select = if value >= 0.5 { Select::B } else { Select::A },
            CONTROL_MIX => controls.mix = value,
            CONTROL_PAN_L => controls.pan_l = value,
            CONTROL_PAN_R => controls.pan_r = value,
            CONTROL_VOL_L_DB => controls.vol_l_db = value,
            CONTROL_VOL_R_DB => controls.vol_r_db = value,
            _ => return,
        }
        self.set_controls(controls);
    }

    /// PreMix: copies the chain's input into the top/bottom sub-chain input
    /// buffers. In L/R mode, channel 0 routes to `top` and channel 1 (or a
    /// copy of channel 0 if the chain is mono) routes to `bottom`.
    pub fn pre_mix(&self, input: &[&[f32]], top_in: &mut [&mut [f32]], bottom_in: &mut [&mut [f32]], frames: usize) {
        match self.controls.split_type {
            SplitType::Lr => {
                let left = input.first().copied().unwrap_or(&[]);
                let right = input.get(1).copied().unwrap_or(left);
                if let Some(top0) = top_in.first_mut() {
                    top0[..frames].copy_from_slice(&left[..frames]);
                }
                if let Some(bottom0) = bottom_in.first_mut() {
                    bottom0[..frames].copy_from_slice(&right[..frames]);
                }
            }
            SplitType::Ab | SplitType::Mix => {
                for (ch, dst) in top_in.iter_mut().enumerate() {
                    let src = input.get(ch.min(input.len().saturating_sub(1))).copied().unwrap_or(&[]);
                    dst[..frames].copy_from_slice(&src[..frames]);
                }
                for (ch, dst) in bottom_in.iter_mut().enumerate() {
                    let src = input.get(ch.min(input.len().saturating_sub(1))).copied().unwrap_or(&[]);
                    dst[..frames].copy_from_slice(&src[..frames]);
                }
            }
        }
    }

    /// PostMix: sums the two sub-chain outputs into `output` with the
    /// current (possibly mid-ramp) gains. When a sub-chain's channel count
    /// matches the output's, channels combine 1:1 with no pan applied —
    /// this is what makes the mix-neutrality property hold exactly for an
    /// already-stereo (or already-mono) pass-through pair. Pan only
    /// spreads a genuinely mono sub-chain output across a stereo bus.
    pub fn post_mix(&mut self, top_out: &[&[f32]], bottom_out: &[&[f32]], output: &mut [&mut [f32]], frames: usize) {
        for ch in output.iter_mut() {
            ch[..frames].fill(0.0);
        }

        for i in 0..frames {
            let top_gain = self.top_gain.tick();
            let bottom_gain = self.bottom_gain.tick();
            add_side(top_out, output, i, top_gain, self.controls.pan_l);
            add_side(bottom_out, output, i, bottom_gain, self.controls.pan_r);
        }
    }
}

fn add_side(side_out: &[&[f32]], output: &mut [&mut [f32]], i: usize, gain: f32, pan: f32) {
    if gain == 0.0 || side_out.is_empty() {
        return;
    }
    if side_out.len() == output.len() {
        for (ch, out_ch) in output.iter_mut().enumerate() {
            out_ch[i] += gain * side_out[ch][i];
        }
    } else if side_out.len() == 1 && output.len() == 2 {
        let (l, r) = pan_law(pan);
        let mono = side_out[0][i];
        output[0][i] += gain * l * mono;
        output[1][i] += gain * r * mono;
    } else {
        let n = side_out.len().min(output.len());
        for ch in 0..n {
            output[ch][i] += gain * side_out[ch][i];
        }
    }
}
