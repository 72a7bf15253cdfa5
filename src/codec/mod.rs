// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! MIDI 1.0 wire codec
//!
//! Translates between raw channel voice messages and [`MidiEvent`]s.
//! All functions are pure and can be invoked from any thread.

use std::fmt;

use strum::{EnumCount, EnumDiscriminants, EnumIter};
use thiserror::Error;

mod split;
pub use self::split::{MessageSplitter, WireMessage};


pub const MAX_CHANNEL: u8 = 0x0f;

pub const MAX_U7: u8 = 0x7f;

pub const MAX_U14: u16 = 0x3fff;

/// Neutral position of the pitch bend wheel.
pub const PITCH_BEND_CENTER: u16 = 0x2000;

const STATUS_NOTE_OFF: u8 = 0x80;
const STATUS_NOTE_ON: u8 = 0x90;
const STATUS_POLY_PRESSURE: u8 = 0xa0;
const STATUS_CONTROL_CHANGE: u8 = 0xb0;
const STATUS_PROGRAM_CHANGE: u8 = 0xc0;
const STATUS_CHANNEL_PRESSURE: u8 = 0xd0;
const STATUS_PITCH_BEND: u8 = 0xe0;
const STATUS_SYSTEM: u8 = 0xf0;

/// Decoded channel voice message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDiscriminants)]
#[strum_discriminants(name(MidiEventKind))]
#[strum_discriminants(derive(strum::Display, EnumIter, EnumCount, Hash))]
pub enum MidiEvent {
    NoteOn {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    /// Also produced when decoding a note on with zero velocity.
    NoteOff {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    ControlChange {
        channel: u8,
        controller: u8,
        value: u8,
    },
    ProgramChange {
        channel: u8,
        program: u8,
    },
    PitchBend {
        channel: u8,
        /// 14-bit value, centered at [`PITCH_BEND_CENTER`]
        value: u16,
    },
}

impl MidiEvent {
    #[must_use]
    pub fn kind(&self) -> MidiEventKind {
        self.into()
    }

    #[must_use]
    pub const fn channel(&self) -> u8 {
        match *self {
            Self::NoteOn { channel, .. }
            | Self::NoteOff { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::ProgramChange { channel, .. }
            | Self::PitchBend { channel, .. } => channel,
        }
    }

    /// Check that all fields are within their wire ranges.
    pub fn validate(&self) -> Result<(), InvalidArgument> {
        validate_channel(self.channel())?;
        match *self {
            Self::NoteOn { note, velocity, .. } | Self::NoteOff { note, velocity, .. } => {
                validate_u7("note", note)?;
                validate_u7("velocity", velocity)
            }
            Self::ControlChange {
                controller, value, ..
            } => {
                validate_u7("controller", controller)?;
                validate_u7("value", value)
            }
            Self::ProgramChange { program, .. } => validate_u7("program", program),
            Self::PitchBend { value, .. } => {
                if value > MAX_U14 {
                    return Err(InvalidArgument::PitchBend(value));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => write!(f, "NoteOn(ch={channel} note={note} vel={velocity})"),
            Self::NoteOff {
                channel,
                note,
                velocity,
            } => write!(f, "NoteOff(ch={channel} note={note} vel={velocity})"),
            Self::ControlChange {
                channel,
                controller,
                value,
            } => write!(f, "ControlChange(ch={channel} cc={controller} val={value})"),
            Self::ProgramChange { channel, program } => {
                write!(f, "ProgramChange(ch={channel} prog={program})")
            }
            Self::PitchBend { channel, value } => {
                write!(f, "PitchBend(ch={channel} val={value})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidArgument {
    #[error("channel {0} out of range [0, 15]")]
    Channel(u8),
    #[error("{field} {value} out of range [0, 127]")]
    DataByte { field: &'static str, value: u8 },
    #[error("pitch bend {0} out of range [0, 16383]")]
    PitchBend(u16),
}

/// Garbled, truncated, or otherwise unparsable wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed MIDI message")]
pub struct MalformedMessage;

const fn validate_channel(channel: u8) -> Result<(), InvalidArgument> {
    if channel > MAX_CHANNEL {
        return Err(InvalidArgument::Channel(channel));
    }
    Ok(())
}

const fn validate_u7(field: &'static str, value: u8) -> Result<(), InvalidArgument> {
    if value > MAX_U7 {
        return Err(InvalidArgument::DataByte { field, value });
    }
    Ok(())
}

/// A single wire message with at most 2 data bytes.
///
/// Stored inline to avoid allocations on the receiving thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawMidiMessage {
    bytes: [u8; 3],
    len: u8,
}

impl RawMidiMessage {
    pub const MAX_LEN: usize = 3;

    /// Returns `None` if `bytes` exceeds [`Self::MAX_LEN`].
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > Self::MAX_LEN {
            return None;
        }
        let mut msg = Self::default();
        msg.bytes[..bytes.len()].copy_from_slice(bytes);
        #[allow(clippy::cast_possible_truncation)]
        {
            msg.len = bytes.len() as u8;
        }
        Some(msg)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    fn push(&mut self, byte: u8) {
        debug_assert!(self.len() < Self::MAX_LEN);
        self.bytes[self.len()] = byte;
        self.len += 1;
    }
}

impl AsRef<[u8]> for RawMidiMessage {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for RawMidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x?}", self.as_bytes())
    }
}

/// Decode a single wire message.
///
/// Not each well-formed message results in an event, i.e. returning
/// `Ok(None)` is not an error. System messages and aftertouch are
/// out of scope and ignored.
pub fn try_decode(input: &[u8]) -> Result<Option<MidiEvent>, MalformedMessage> {
    let Some((&status, data)) = input.split_first() else {
        return Err(MalformedMessage);
    };
    if status & 0x80 == 0 {
        return Err(MalformedMessage);
    }
    if status >= STATUS_SYSTEM {
        return Ok(None);
    }
    if data.iter().any(|&byte| byte > MAX_U7) {
        return Err(MalformedMessage);
    }
    let channel = status & MAX_CHANNEL;
    let event = match (status & 0xf0, data) {
        (STATUS_NOTE_OFF, &[note, velocity]) => MidiEvent::NoteOff {
            channel,
            note,
            velocity,
        },
        // Note on with zero velocity is a note off by MIDI convention
        (STATUS_NOTE_ON, &[note, 0]) => MidiEvent::NoteOff {
            channel,
            note,
            velocity: 0,
        },
        (STATUS_NOTE_ON, &[note, velocity]) => MidiEvent::NoteOn {
            channel,
            note,
            velocity,
        },
        (STATUS_CONTROL_CHANGE, &[controller, value]) => MidiEvent::ControlChange {
            channel,
            controller,
            value,
        },
        (STATUS_PROGRAM_CHANGE, &[program]) => MidiEvent::ProgramChange { channel, program },
        (STATUS_PITCH_BEND, &[lsb, msb]) => MidiEvent::PitchBend {
            channel,
            value: (u16::from(msb) << 7) | u16::from(lsb),
        },
        (STATUS_POLY_PRESSURE, &[_, _]) | (STATUS_CHANNEL_PRESSURE, &[_]) => return Ok(None),
        _ => return Err(MalformedMessage),
    };
    Ok(Some(event))
}

/// Decode a single wire message, discarding the reason for
/// not producing an event.
#[must_use]
pub fn decode(input: &[u8]) -> Option<MidiEvent> {
    try_decode(input).ok().flatten()
}

/// Encode an event into a wire message.
///
/// Out-of-range fields are rejected instead of clamped.
pub fn encode(event: &MidiEvent) -> Result<RawMidiMessage, InvalidArgument> {
    event.validate()?;
    let mut msg = RawMidiMessage::default();
    match *event {
        MidiEvent::NoteOn {
            channel,
            note,
            velocity,
        } => {
            msg.push(STATUS_NOTE_ON | channel);
            msg.push(note);
            msg.push(velocity);
        }
        MidiEvent::NoteOff {
            channel,
            note,
            velocity,
        } => {
            msg.push(STATUS_NOTE_OFF | channel);
            msg.push(note);
            msg.push(velocity);
        }
        MidiEvent::ControlChange {
            channel,
            controller,
            value,
        } => {
            msg.push(STATUS_CONTROL_CHANGE | channel);
            msg.push(controller);
            msg.push(value);
        }
        MidiEvent::ProgramChange { channel, program } => {
            msg.push(STATUS_PROGRAM_CHANGE | channel);
            msg.push(program);
        }
        MidiEvent::PitchBend { channel, value } => {
            msg.push(STATUS_PITCH_BEND | channel);
            // LSB first
            #[allow(clippy::cast_possible_truncation)]
            {
                msg.push((value & 0x7f) as u8);
                msg.push((value >> 7) as u8);
            }
        }
    }
    Ok(msg)
}
