//! C2 — the command/telemetry protocol layered over the two [`RingBuffer`]s
//! that connect the audio thread to the service thread.
//!
//! Each frame is a fixed 4-byte header (`opcode: u16`, `payload_bytes: u16`)
//! followed by a `bincode`-encoded payload. The opcode in the header exists
//! for logging and the fault-policy overflow counter; the payload itself is
//! the self-describing encoding of a [`Command`] or [`Event`] variant, so
//! decoding never has to hand-roll a second dispatch table.
//!
//! Handles that cross the ring (a swapped-in pedalboard runtime, a VU
//! subscription, a parameter request) are opaque `u64`s here — see
//! [`crate::handle`] for how they're minted and redeemed. This keeps the
//! wire format ignorant of the heap types on either side, matching the
//! ownership-split guidance: T_A never dereferences anything it didn't
//! receive through the ring.

use serde::{Deserialize, Serialize};

use crate::ringbuffer::{CommandRing, EventRing, RingBuffer};

pub const FRAME_HEADER_BYTES: usize = 4;

fn encode_header(opcode: u16, payload_bytes: u16) -> [u8; FRAME_HEADER_BYTES] {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    header[0..2].copy_from_slice(&opcode.to_le_bytes());
    header[2..4].copy_from_slice(&payload_bytes.to_le_bytes());
    header
}

fn decode_header(bytes: [u8; FRAME_HEADER_BYTES]) -> (u16, u16) {
    let opcode = u16::from_le_bytes([bytes[0], bytes[1]]);
    let payload_bytes = u16::from_le_bytes([bytes[2], bytes[3]]);
    (opcode, payload_bytes)
}

/// Service → audio opcodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    ReplacePedalboard { runtime_handle: u64 },
    SetControl { effect_index: u32, control_index: u32, value: f32 },
    SetBypass { effect_index: u32, enabled: bool },
    SetInputVolume { db: f32 },
    SetOutputVolume { db: f32 },
    SetVuSubscriptions { config_handle: u64 },
    FreeVuSubscriptions { config_handle: u64 },
    SetMonitorPortSubscription { list_handle: u64 },
    FreeMonitorPortSubscription { list_handle: u64 },
    AckVuUpdate,
    AckMonitorPortUpdate { handle: u64 },
    ParameterRequest { request_handle: u64 },
    MidiProgramChange { request_handle: u64 },
    NextMidiProgram { request_handle: u64 },
}

impl Command {
    /// Opcode used only for the frame header; decoding relies on the
    /// payload's own encoding, not this value.
    pub fn opcode(&self) -> u16 {
        match self {
            Command::ReplacePedalboard { .. } => 1,
            Command::SetControl { .. } => 2,
            Command::SetBypass { .. } => 3,
            Command::SetInputVolume { .. } => 4,
            Command::SetOutputVolume { .. } => 5,
            Command::SetVuSubscriptions { .. } => 6,
            Command::FreeVuSubscriptions { .. } => 7,
            Command::SetMonitorPortSubscription { .. } => 8,
            Command::FreeMonitorPortSubscription { .. } => 9,
            Command::AckVuUpdate => 10,
            Command::AckMonitorPortUpdate { .. } => 11,
            Command::ParameterRequest { .. } => 12,
            Command::MidiProgramChange { .. } => 13,
            Command::NextMidiProgram { .. } => 14,
        }
    }
}

/// Audio → service opcodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    PedalboardReplaced { old_runtime_handle: u64 },
    SendVuUpdate { snapshot_handle: u64 },
    SendMonitorPortUpdate { handle: u64, value: f32 },
    AtomOutput { instance_id: u64, bytes: Vec<u8> },
    Lv2StateChanged { instance_id: u64 },
    MaybeLv2StateChanged { instance_id: u64 },
    MidiValueChanged { instance_id: u64, control_index: u32, value: f32 },
    OnMidiListen { is_note: bool, note_or_cc: u8 },
    ParameterRequestComplete { request_handle: u64 },
    AudioStopped,
    Lv2ErrorMessage { instance_id: u64, text: String },
    Underrun { count: u64 },
}

impl Event {
    pub fn opcode(&self) -> u16 {
        match self {
            Event::PedalboardReplaced { .. } => 101,
            Event::SendVuUpdate { .. } => 102,
            Event::SendMonitorPortUpdate { .. } => 103,
            Event::AtomOutput { .. } => 104,
            Event::Lv2StateChanged { .. } => 105,
            Event::MaybeLv2StateChanged { .. } => 106,
            Event::MidiValueChanged { .. } => 107,
            Event::OnMidiListen { .. } => 108,
            Event::ParameterRequestComplete { .. } => 109,
            Event::AudioStopped => 110,
            Event::Lv2ErrorMessage { .. } => 111,
            Event::Underrun { .. } => 112,
        }
    }
}

/// Encodes `value` and writes header+payload as one atomic frame. Never
/// blocks; on overflow the caller's overflow counter (the ring's own) has
/// already been bumped by [`RingBuffer::write_two`].
fn push<const W: bool, const S: bool, T>(ring: &RingBuffer<W, S>, value: &T, opcode: u16) -> bool
where
T: Serialize,
{
    let payload = match bincode::serialize(value) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("protocol encode failed, dropping frame: {err}");
            return false;
        }
    };
    debug_assert!(payload.len() <= u16::MAX as usize, "frame payload too large");
    let header = encode_header(opcode, payload.len() as u16);
    ring.write_two(&header, &payload)
}

fn pop<const W: bool, const S: bool, T>(ring: &RingBuffer<W, S>) -> Option<T>
where
T: for<'de> Deserialize<'de>,
{
    if ring.read_space() < FRAME_HEADER_BYTES {
        return None;
    }
    let mut header_bytes = [0u8; FRAME_HEADER_BYTES];
    if !ring.try_read(&mut header_bytes) {
        return None;
    }
    let (_opcode, payload_bytes) = decode_header(header_bytes);

    let mut payload = vec![0u8; payload_bytes as usize];
    if !ring.try_read(&mut payload) {
        // The write side guarantees header+payload land atomically (frame
        // atomicity, invariant 4); reaching here means the protocol itself
        // is broken, not a transient race.
        log::error!("ring frame header present without its payload");
        return None;
    }

    match bincode::deserialize(&payload) {
        Ok(value) => Some(value),
        Err(err) => {
            log::error!("protocol decode failed: {err}");
            None
        }
    }
}

pub fn push_command(ring: &CommandRing, cmd: &Command) -> bool {
    push(ring, cmd, cmd.opcode())
}

pub fn pop_command(ring: &CommandRing) -> Option<Command> {
    pop(ring)
}

pub fn push_event(ring: &EventRing, ev: &Event) -> bool {
    push(ring, ev, ev.opcode())
}

pub fn pop_event(ring: &EventRing) -> Option<Event> {
    pop(ring)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_the_ring() {
        let ring: CommandRing = CommandRing::new(256, false);
        let cmd = Command::SetControl {
            effect_index: 3,
            control_index: 7,
            value: 0.25,
        };
        assert!(push_command(&ring, &cmd));
        match pop_command(&ring).expect("a frame was written") {
            Command::SetControl { effect_index, control_index, value } => {
                assert_eq!(effect_index, 3);
                assert_eq!(control_index, 7);
                assert_eq!(value, 0.25);
            }
            other => panic!("unexpected command decoded: {other:?}"),
        }
    }

    #[test]
    fn ordering_is_preserved_across_several_frames() {
        let ring: CommandRing = CommandRing::new(512, false);
        for i in 0..8 {
            assert!(push_command(&ring, &Command::SetInputVolume { db: i as f32 }));
        }
        for i in 0..8 {
            match pop_command(&ring).unwrap() {
                Command::SetInputVolume { db } => assert_eq!(db, i as f32),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(pop_command(&ring).is_none());
    }

    #[test]
    fn event_with_variable_length_payload_round_trips() {
        let ring: EventRing = EventRing::new(256, false);
        let ev = Event::Lv2ErrorMessage {
            instance_id: 42,
            text: "state restore failed".to_string(),
        };
        assert!(push_event(&ring, &ev));
        match pop_event(&ring).unwrap() {
            Event::Lv2ErrorMessage { instance_id, text } => {
                assert_eq!(instance_id, 42);
                assert_eq!(text, "state restore failed");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn empty_ring_returns_none_without_blocking() {
        let ring: CommandRing = CommandRing::new(64, false);
        assert!(pop_command(&ring).is_none());
    }
}
