// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fmt;

use midly::{
    live::{LiveEvent, SystemRealtime},
    MidiMessage,
};

/// The longest message that can be routed. Channel voice messages and system
/// realtime messages all fit; SysEx does not.
pub const MAX_MESSAGE_LEN: usize = 3;

/// A single routable MIDI message.
///
/// Messages are fixed size and `Copy` so that they can be queued from the
/// transport callback thread and drained on the audio thread without allocating.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Message {
    bytes: [u8; MAX_MESSAGE_LEN],
    len: u8,
}

impl Message {
    /// Creates a message from raw bytes as delivered by the transport. Returns None
    /// if the bytes don't form a complete MIDI event or don't fit in a message.
    pub fn from_bytes(raw: &[u8]) -> Option<Message> {
        if raw.is_empty() || raw.len() > MAX_MESSAGE_LEN {
            return None;
        }
        LiveEvent::parse(raw).ok()?;

        let mut bytes = [0u8; MAX_MESSAGE_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Message {
            bytes,
            len: raw.len() as u8,
        })
    }

    /// The raw bytes of the message.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Parses the message back into a live event.
    pub fn event(&self) -> Option<LiveEvent<'_>> {
        LiveEvent::parse(self.bytes()).ok()
    }

    /// True for note on and note off messages, including note on with zero velocity.
    pub fn is_note_on_or_off(&self) -> bool {
        matches!(
            self.event(),
            Some(LiveEvent::Midi {
                message: MidiMessage::NoteOn { .. } | MidiMessage::NoteOff { .. },
                ..
            })
        )
    }

    /// True for control change messages.
    pub fn is_controller(&self) -> bool {
        matches!(
            self.event(),
            Some(LiveEvent::Midi {
                message: MidiMessage::Controller { .. },
                ..
            })
        )
    }

    /// True for the transport control realtime messages: clock, start, stop and continue.
    pub fn is_transport_control(&self) -> bool {
        matches!(
            self.event(),
            Some(LiveEvent::Realtime(
                SystemRealtime::TimingClock
                    | SystemRealtime::Start
                    | SystemRealtime::Stop
                    | SystemRealtime::Continue
            ))
        )
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({:02X?})", self.bytes())
    }
}

/// Creates a note on message. Channel is expected to be [1, 16].
#[cfg(test)]
pub fn note_on(channel: u8, key: u8, velocity: u8) -> Message {
    Message::from_bytes(&[0x90 | (channel - 1), key, velocity]).expect("valid note on")
}

/// Creates a note off message. Channel is expected to be [1, 16].
#[cfg(test)]
pub fn note_off(channel: u8, key: u8) -> Message {
    Message::from_bytes(&[0x80 | (channel - 1), key, 0]).expect("valid note off")
}

/// Creates a control change message. Channel is expected to be [1, 16].
#[cfg(test)]
pub fn control_change(channel: u8, controller: u8, value: u8) -> Message {
    Message::from_bytes(&[0xB0 | (channel - 1), controller, value]).expect("valid control change")
}

#[cfg(test)]
mod test {
    use midly::{
        live::LiveEvent,
        num::{u4, u7},
        MidiMessage,
    };

    use super::{control_change, note_off, note_on, Message};

    #[test]
    fn classification() {
        assert!(note_on(1, 60, 100).is_note_on_or_off());
        assert!(note_off(16, 60).is_note_on_or_off());
        // Note on with zero velocity is still a note message.
        assert!(note_on(1, 60, 0).is_note_on_or_off());
        assert!(!note_on(1, 60, 100).is_controller());

        assert!(control_change(3, 7, 127).is_controller());
        assert!(!control_change(3, 7, 127).is_note_on_or_off());

        let program_change = Message::from_bytes(&[0xC0, 5]).expect("program change");
        assert!(!program_change.is_note_on_or_off());
        assert!(!program_change.is_controller());
        assert!(!program_change.is_transport_control());
    }

    #[test]
    fn transport_control() {
        for byte in [0xF8, 0xFA, 0xFB, 0xFC] {
            let message = Message::from_bytes(&[byte]).expect("realtime message");
            assert!(message.is_transport_control(), "{:?}", message);
        }

        let active_sensing = Message::from_bytes(&[0xFE]).expect("active sensing");
        assert!(!active_sensing.is_transport_control());
    }

    #[test]
    fn rejects_invalid_bytes() {
        assert!(Message::from_bytes(&[]).is_none());
        assert!(Message::from_bytes(&[0x90, 60]).is_none());
        assert!(Message::from_bytes(&[1, 2, 3]).is_none());
        assert!(Message::from_bytes(&[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]).is_none());
    }

    #[test]
    fn parses_back_into_an_event() {
        assert_eq!(
            Some(LiveEvent::Midi {
                channel: u4::from(2),
                message: MidiMessage::Controller {
                    controller: u7::from(74),
                    value: u7::from(12),
                },
            }),
            control_change(3, 74, 12).event()
        );
    }
}
