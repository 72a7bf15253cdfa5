// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use std::mem;

use super::RawMidiMessage;

const SYSEX_START: u8 = 0xf0;
const SYSEX_END: u8 = 0xf7;
const REALTIME_MIN: u8 = 0xf8;

/// A single message split off from a received batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMessage<'a> {
    /// Channel voice, system common, or system real-time message.
    ///
    /// Incomplete messages and orphaned data bytes are passed on
    /// as is and will be rejected by the decoder.
    Short(RawMidiMessage),

    /// System exclusive message, including the start and (if present)
    /// the end byte. Passed through without further inspection.
    SysEx(&'a [u8]),
}

const fn expected_message_len(status: u8) -> usize {
    match status {
        0x80..=0xbf | 0xe0..=0xef | 0xf2 => 3,
        0xc0..=0xdf | 0xf1 | 0xf3 => 2,
        _ => 1,
    }
}

/// Splits a batch of received bytes into individual wire messages.
///
/// Supports running status for channel messages and real-time
/// messages that are interleaved with other messages.
#[derive(Debug, Clone)]
pub struct MessageSplitter<'a> {
    input: &'a [u8],
    pos: usize,
    running_status: Option<u8>,
    pending: RawMidiMessage,
    pending_len: usize,
}

impl<'a> MessageSplitter<'a> {
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            running_status: None,
            pending: RawMidiMessage::default(),
            pending_len: 0,
        }
    }

    fn begin_pending(&mut self, status: u8) {
        debug_assert!(self.pending.is_empty());
        self.pending.push(status);
        self.pending_len = expected_message_len(status);
    }

    fn take_pending(&mut self) -> WireMessage<'a> {
        self.pending_len = 0;
        WireMessage::Short(mem::take(&mut self.pending))
    }

    fn take_pending_if_complete(&mut self) -> Option<WireMessage<'a>> {
        (self.pending.len() >= self.pending_len).then(|| self.take_pending())
    }

    fn take_sysex(&mut self) -> &'a [u8] {
        let input = self.input;
        let start = self.pos;
        debug_assert_eq!(input[start], SYSEX_START);
        let body = &input[start + 1..];
        // An unterminated message ends at the next non-real-time status byte
        let body_len = body
            .iter()
            .position(|&byte| byte & 0x80 != 0 && byte < REALTIME_MIN)
            .map_or(body.len(), |index| {
                if body[index] == SYSEX_END {
                    index + 1
                } else {
                    index
                }
            });
        self.pos = start + 1 + body_len;
        &input[start..self.pos]
    }
}

impl<'a> Iterator for MessageSplitter<'a> {
    type Item = WireMessage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&byte) = self.input.get(self.pos) {
            if byte >= REALTIME_MIN {
                self.pos += 1;
                let mut msg = RawMidiMessage::default();
                msg.push(byte);
                return Some(WireMessage::Short(msg));
            }
            if byte & 0x80 != 0 {
                if !self.pending.is_empty() {
                    // The status byte is consumed on the next invocation
                    return Some(self.take_pending());
                }
                if byte == SYSEX_START {
                    self.running_status = None;
                    return Some(WireMessage::SysEx(self.take_sysex()));
                }
                self.pos += 1;
                // System common messages cancel the running status
                self.running_status = (byte < SYSEX_START).then_some(byte);
                self.begin_pending(byte);
            } else {
                self.pos += 1;
                if self.pending.is_empty() {
                    let Some(status) = self.running_status else {
                        log::trace!("Orphaned data byte {byte:#04x}");
                        let mut msg = RawMidiMessage::default();
                        msg.push(byte);
                        return Some(WireMessage::Short(msg));
                    };
                    self.begin_pending(status);
                }
                self.pending.push(byte);
            }
            if let Some(msg) = self.take_pending_if_complete() {
                return Some(msg);
            }
        }
        // Truncated trailing message
        (!self.pending.is_empty()).then(|| self.take_pending())
    }
}
