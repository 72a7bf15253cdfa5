// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Hand-off of received MIDI input to the host
//!
//! The dispatcher runs on the transport's notification thread. It only
//! decodes and enqueues. Events are delivered to a [`MidiEventSink`]
//! when the host drains the queue on its own thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::{
    codec::{try_decode, MalformedMessage, MessageSplitter, WireMessage},
    MidiEvent, NativeDeviceId,
};

/// Origin of an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Received from a device
    Device(NativeDeviceId),

    /// Injected by the application
    Injected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub source: EventSource,
    pub event: MidiEvent,
}

/// Consumer of inbound events on the host thread
pub trait MidiEventSink {
    /// Invoked for each event in the order of arrival.
    ///
    /// Ownership of the event is transferred to the sink.
    fn deliver_event(&mut self, event: InboundEvent);

    /// Invoked when the transport has reported added or removed devices.
    ///
    /// The default implementation does nothing.
    fn devices_changed(&mut self) {}
}

impl<F> MidiEventSink for F
where
    F: FnMut(InboundEvent),
{
    fn deliver_event(&mut self, event: InboundEvent) {
        self(event);
    }
}

/// Counters of the inbound path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundStats {
    /// Wire messages received from all devices
    pub received: u64,

    /// Events enqueued for delivery, including injected events
    pub enqueued: u64,

    /// Events discarded because the queue was full
    pub dropped: u64,

    /// Messages that could not be decoded
    pub malformed: u64,

    /// Well-formed messages without a corresponding event, e.g. SysEx or clock
    pub ignored: u64,
}

#[derive(Debug, Default)]
struct InboundCounters {
    received: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    ignored: AtomicU64,
}

fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug)]
pub(crate) struct InboundDispatcher {
    sender: Sender<InboundEvent>,
    counters: InboundCounters,
    closed: AtomicBool,
}

impl InboundDispatcher {
    /// Create a dispatcher with a bounded queue.
    ///
    /// The queue keeps the oldest events if full, newer events
    /// are dropped.
    #[must_use]
    pub(crate) fn new(capacity: usize) -> (Self, Receiver<InboundEvent>) {
        debug_assert!(capacity > 0);
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let dispatcher = Self {
            sender,
            counters: Default::default(),
            closed: AtomicBool::new(false),
        };
        (dispatcher, receiver)
    }

    /// Handle a batch of received bytes.
    ///
    /// Invoked on the transport's thread. Never blocks. Each batch is
    /// split independently, i.e. running status and incomplete messages
    /// do not carry over into the next batch.
    pub(crate) fn handle_input(&self, source: &NativeDeviceId, input: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            log::trace!("Discarding MIDI input from {source} after shutdown: {input:02x?}");
            return;
        }
        for msg in MessageSplitter::new(input) {
            increment(&self.counters.received);
            let raw = match msg {
                WireMessage::Short(raw) => raw,
                WireMessage::SysEx(sysex) => {
                    log::trace!("Ignoring SysEx from {source} ({len} bytes)", len = sysex.len());
                    increment(&self.counters.ignored);
                    continue;
                }
            };
            match try_decode(raw.as_bytes()) {
                Ok(Some(event)) => {
                    self.enqueue(InboundEvent {
                        source: EventSource::Device(source.clone()),
                        event,
                    });
                }
                Ok(None) => {
                    increment(&self.counters.ignored);
                }
                Err(MalformedMessage) => {
                    log::debug!("Dropping malformed MIDI input from {source}: {raw:?}");
                    increment(&self.counters.malformed);
                }
            }
        }
    }

    /// Enqueue an application provided event.
    pub(crate) fn inject(&self, event: MidiEvent) -> bool {
        self.enqueue(InboundEvent {
            source: EventSource::Injected,
            event,
        })
    }

    fn enqueue(&self, event: InboundEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => {
                increment(&self.counters.enqueued);
                true
            }
            Err(TrySendError::Full(event)) => {
                log::debug!("Event queue is full: Dropping {event:?}", event = event.event);
                increment(&self.counters.dropped);
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                log::trace!("Event queue is closed: Dropping {event:?}", event = event.event);
                increment(&self.counters.dropped);
                false
            }
        }
    }

    /// Stop accepting input from the transport.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub(crate) fn stats(&self) -> InboundStats {
        let InboundCounters {
            received,
            enqueued,
            dropped,
            malformed,
            ignored,
        } = &self.counters;
        InboundStats {
            received: received.load(Ordering::Relaxed),
            enqueued: enqueued.load(Ordering::Relaxed),
            dropped: dropped.load(Ordering::Relaxed),
            malformed: malformed.load(Ordering::Relaxed),
            ignored: ignored.load(Ordering::Relaxed),
        }
    }
}

/// Deliver the events that are currently queued.
///
/// Events that arrive while draining are left for the next invocation.
pub(crate) fn drain_into<S>(receiver: &Receiver<InboundEvent>, sink: &mut S) -> usize
where
    S: MidiEventSink + ?Sized,
{
    let pending = receiver.len();
    let mut delivered = 0;
    while delivered < pending {
        let Ok(event) = receiver.try_recv() else {
            break;
        };
        sink.deliver_event(event);
        delivered += 1;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note_on(note: u8) -> MidiEvent {
        MidiEvent::NoteOn {
            channel: 0,
            note,
            velocity: 100,
        }
    }

    fn collect(receiver: &Receiver<InboundEvent>) -> Vec<MidiEvent> {
        let mut events = Vec::new();
        drain_into(receiver, &mut |event: InboundEvent| events.push(event.event));
        events
    }

    #[test]
    fn batch_is_split_and_decoded_in_order() {
        let (dispatcher, receiver) = InboundDispatcher::new(16);
        let source = NativeDeviceId::from("keys");
        dispatcher.handle_input(&source, &[0x90, 60, 100, 61, 100, 0xf8, 0x80, 60, 0]);
        let mut events = Vec::new();
        drain_into(&receiver, &mut |event: InboundEvent| events.push(event));
        assert_eq!(
            vec![
                note_on(60),
                note_on(61),
                MidiEvent::NoteOff {
                    channel: 0,
                    note: 60,
                    velocity: 0
                },
            ],
            events.iter().map(|event| event.event).collect::<Vec<_>>()
        );
        assert!(events
            .iter()
            .all(|event| event.source == EventSource::Device(source.clone())));
        assert_eq!(
            InboundStats {
                received: 4,
                enqueued: 3,
                dropped: 0,
                malformed: 0,
                ignored: 1,
            },
            dispatcher.stats()
        );
    }

    #[test]
    fn malformed_input_is_counted_and_dropped() {
        let (dispatcher, receiver) = InboundDispatcher::new(16);
        let source = NativeDeviceId::from("keys");
        // Orphaned data byte, truncated note on, valid program change
        dispatcher.handle_input(&source, &[0x3c, 0x90, 0x3c, 0xc0, 0x05]);
        assert_eq!(
            vec![MidiEvent::ProgramChange {
                channel: 0,
                program: 5
            }],
            collect(&receiver)
        );
        let stats = dispatcher.stats();
        assert_eq!(2, stats.malformed);
        assert_eq!(1, stats.enqueued);
    }

    #[test]
    fn full_queue_drops_newest_events() {
        let (dispatcher, receiver) = InboundDispatcher::new(2);
        let source = NativeDeviceId::from("keys");
        for note in 60..65 {
            dispatcher.handle_input(&source, &[0x90, note, 100]);
        }
        assert_eq!(vec![note_on(60), note_on(61)], collect(&receiver));
        assert_eq!(3, dispatcher.stats().dropped);
        // Capacity is available again after draining
        dispatcher.handle_input(&source, &[0x90, 70, 100]);
        assert_eq!(vec![note_on(70)], collect(&receiver));
    }

    #[test]
    fn drain_is_bounded_by_queued_events() {
        let (dispatcher, receiver) = InboundDispatcher::new(8);
        assert!(dispatcher.inject(note_on(1)));
        assert!(dispatcher.inject(note_on(2)));
        let mut delivered = Vec::new();
        let count = drain_into(&receiver, &mut |event: InboundEvent| {
            // Arrives while draining
            dispatcher.inject(note_on(event.event.channel() + 100));
            delivered.push(event);
        });
        assert_eq!(2, count);
        assert!(delivered
            .iter()
            .all(|event| event.source == EventSource::Injected));
        assert_eq!(2, collect(&receiver).len());
    }

    #[test]
    fn closed_dispatcher_discards_input() {
        let (dispatcher, receiver) = InboundDispatcher::new(8);
        dispatcher.close();
        dispatcher.handle_input(&NativeDeviceId::from("keys"), &[0x90, 60, 100]);
        assert!(collect(&receiver).is_empty());
        assert_eq!(InboundStats::default(), dispatcher.stats());
    }

    #[test]
    fn running_status_does_not_carry_over_between_batches() {
        let (dispatcher, receiver) = InboundDispatcher::new(8);
        let source = NativeDeviceId::from("keys");
        dispatcher.handle_input(&source, &[0x90, 60, 100]);
        dispatcher.handle_input(&source, &[61, 100]);
        assert_eq!(vec![note_on(60)], collect(&receiver));
        assert_eq!(2, dispatcher.stats().malformed);
    }
}
