// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Device sessions
//!
//! A [`MidiSession`] owns the device registry and all open ports of a
//! single transport. Connection state transitions are serialized by a
//! single lock. Received input is decoded on the transport's thread and
//! queued until the host polls for events on its own thread.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::{
    codec::{encode, InvalidArgument},
    device::registry::DeviceRegistry,
    inbound::{drain_into, InboundDispatcher, InboundEvent, InboundStats, MidiEventSink},
    transport::{MidiTransport, TransportError},
    ConnectionState, Device, DeviceId, MidiEvent,
};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum number of undelivered inbound events
    ///
    /// Events that arrive while the queue is full are dropped.
    pub event_queue_capacity: usize,

    /// Re-enumerate and reconnect devices when polling after the
    /// transport has reported a topology change.
    pub refresh_on_topology_change: bool,
}

impl SessionConfig {
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: Self::DEFAULT_EVENT_QUEUE_CAPACITY,
            refresh_on_topology_change: true,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("session has been shut down")]
    SessionClosed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Error)]
pub enum DisconnectError {
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
}

#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("device {0} not connected")]
    DeviceNotConnected(DeviceId),
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of [`MidiSession::reconnect_all()`]
#[derive(Debug, Default)]
pub struct ReconnectReport {
    pub reconnected: Vec<DeviceId>,
    pub failed: Vec<(DeviceId, ConnectError)>,
}

impl ReconnectReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`MidiSession::poll_events()`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Number of events delivered to the sink
    pub delivered: usize,

    /// The transport has reported added or removed devices
    pub devices_changed: bool,
}

struct SessionShared<T: MidiTransport> {
    transport: T,
    config: SessionConfig,
    registry: Mutex<DeviceRegistry<T::Port>>,
    transition_finished: Condvar,
    dispatcher: Arc<InboundDispatcher>,
    receiver: Receiver<InboundEvent>,
    topology_changed: Arc<AtomicBool>,
}

impl<T: MidiTransport> SessionShared<T> {
    fn release_ports(&self, released: Vec<(Device, T::Port)>) {
        for (device, port) in released {
            log::info!(
                "Closing port of device \"{name}\" ({native_id})",
                name = device.name,
                native_id = device.native_id
            );
            self.transport.close_port(port);
        }
    }
}

impl<T: MidiTransport> Drop for SessionShared<T> {
    fn drop(&mut self) {
        self.dispatcher.close();
        let released = self.registry.get_mut().disconnect_all();
        self.release_ports(released);
    }
}

/// MIDI session of a single transport
///
/// Cloning is cheap and results in another handle to the same session.
/// Ports that are still open are closed when the last handle is dropped.
#[allow(missing_debug_implementations)]
pub struct MidiSession<T: MidiTransport> {
    shared: Arc<SessionShared<T>>,
}

impl<T: MidiTransport> Clone for MidiSession<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MidiTransport> MidiSession<T> {
    /// Register with the transport and enumerate the available devices.
    pub fn start(transport: T, config: SessionConfig) -> Result<Self, TransportError> {
        let (dispatcher, receiver) = InboundDispatcher::new(config.event_queue_capacity);
        let dispatcher = Arc::new(dispatcher);
        let topology_changed = Arc::new(AtomicBool::new(false));
        transport.register_receive_callback({
            let dispatcher = Arc::clone(&dispatcher);
            Arc::new(move |source, input| {
                // Panics must not unwind into the driver
                let handled =
                    panic::catch_unwind(AssertUnwindSafe(|| dispatcher.handle_input(source, input)));
                if handled.is_err() {
                    log::error!("Failed to handle MIDI input from {source}: {input:02x?}");
                }
            })
        });
        transport.register_topology_changed_callback({
            let topology_changed = Arc::clone(&topology_changed);
            Arc::new(move || {
                log::debug!("MIDI devices have changed");
                topology_changed.store(true, Ordering::Release);
            })
        });
        let session = Self {
            shared: Arc::new(SessionShared {
                transport,
                config,
                registry: Mutex::new(DeviceRegistry::default()),
                transition_finished: Condvar::new(),
                dispatcher,
                receiver,
                topology_changed,
            }),
        };
        session.refresh()?;
        Ok(session)
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    fn lock_registry(&self) -> MutexGuard<'_, DeviceRegistry<T::Port>> {
        self.shared.registry.lock()
    }

    /// Re-enumerate all devices.
    ///
    /// Invalidates all previously obtained [`DeviceId`]s. Devices that
    /// are still available keep their connection. Ports of connected
    /// devices that are no longer available are closed.
    pub fn refresh(&self) -> Result<(), TransportError> {
        let listed = self.shared.transport.list_devices()?;
        let released = {
            let mut registry = self.lock_registry();
            let released = registry.replace(listed);
            log::debug!(
                "Enumerated {count} device(s) in generation {generation}",
                count = registry.devices().count(),
                generation = registry.generation()
            );
            // Waiting callers need to re-check their stale ids
            self.shared.transition_finished.notify_all();
            released
        };
        self.shared.release_ports(released);
        Ok(())
    }

    /// Snapshot of all devices of the current enumeration.
    ///
    /// Devices are unique by their native id. Devices with a native id
    /// that has already been listed by the transport are ignored.
    #[must_use]
    pub fn list_devices(&self) -> Vec<Device> {
        self.lock_registry().devices().cloned().collect()
    }

    #[must_use]
    pub fn connected_devices(&self) -> Vec<Device> {
        self.lock_registry()
            .devices()
            .filter(|device| device.is_connected())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn device_info(&self, id: DeviceId) -> Option<Device> {
        self.lock_registry()
            .get(id)
            .map(|entry| entry.device().clone())
    }

    /// Resolve an index of the current enumeration.
    #[must_use]
    pub fn device_id(&self, index: usize) -> Option<DeviceId> {
        self.lock_registry().id_at(index)
    }

    #[must_use]
    pub fn is_connected(&self, id: DeviceId) -> bool {
        self.lock_registry()
            .get(id)
            .is_some_and(|entry| entry.state() == ConnectionState::Connected)
    }

    /// Open the ports of a device.
    ///
    /// Succeeds immediately if the device is already connected. Waits
    /// while a concurrent connect or disconnect of the same device is
    /// in progress.
    pub fn connect(&self, id: DeviceId) -> Result<(), ConnectError> {
        let mut registry = self.lock_registry();
        let (native_id, kind) = loop {
            if self.shared.dispatcher.is_closed() {
                return Err(ConnectError::SessionClosed);
            }
            let entry = registry.get_mut(id).ok_or(ConnectError::DeviceNotFound(id))?;
            match entry.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    entry.begin_connect();
                    let device = entry.device();
                    break (device.native_id.clone(), device.kind);
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    self.shared.transition_finished.wait(&mut registry);
                }
            }
        };
        drop(registry);

        log::debug!("Opening {kind} port(s) of {native_id}");
        let opened = self.shared.transport.open_port(&native_id, kind);

        let mut registry = self.lock_registry();
        let closed = self.shared.dispatcher.is_closed();
        // The device might have been re-enumerated in the meantime
        let (result, orphaned) = match registry.resolve_mut(id, &native_id) {
            Some(entry) if entry.state() == ConnectionState::Connecting && closed => {
                entry.abort_connect();
                log::info!("Session has been shut down while connecting {native_id}");
                (Err(ConnectError::SessionClosed), opened.ok())
            }
            Some(entry) if entry.state() == ConnectionState::Connecting => match opened {
                Ok(port) => {
                    entry.complete_connect(port);
                    log::info!(
                        "Connected device \"{name}\" ({native_id})",
                        name = entry.device().name
                    );
                    (Ok(()), None)
                }
                Err(err) => {
                    entry.abort_connect();
                    log::warn!("Failed to connect {native_id}: {err}");
                    (Err(ConnectError::Transport(err)), None)
                }
            },
            _ => {
                log::info!("Device {native_id} has vanished while connecting");
                (Err(ConnectError::DeviceNotFound(id)), opened.ok())
            }
        };
        self.shared.transition_finished.notify_all();
        drop(registry);

        if let Some(port) = orphaned {
            self.shared.transport.close_port(port);
        }
        result
    }

    /// Close the ports of a device.
    ///
    /// Succeeds immediately if the device is already disconnected.
    pub fn disconnect(&self, id: DeviceId) -> Result<(), DisconnectError> {
        let mut registry = self.lock_registry();
        let (native_id, port) = loop {
            let entry = registry
                .get_mut(id)
                .ok_or(DisconnectError::DeviceNotFound(id))?;
            match entry.state() {
                ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Connected => {
                    let port = entry.begin_disconnect();
                    break (entry.device().native_id.clone(), port);
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    self.shared.transition_finished.wait(&mut registry);
                }
            }
        };
        drop(registry);

        debug_assert!(port.is_some());
        if let Some(port) = port {
            log::debug!("Closing port(s) of {native_id}");
            self.shared.transport.close_port(port);
        }

        let mut registry = self.lock_registry();
        if let Some(entry) = registry.resolve_mut(id, &native_id) {
            if entry.state() == ConnectionState::Disconnecting {
                entry.complete_disconnect();
                log::info!(
                    "Disconnected device \"{name}\" ({native_id})",
                    name = entry.device().name
                );
            }
        }
        self.shared.transition_finished.notify_all();
        Ok(())
    }

    /// Reopen the ports of all connected devices.
    ///
    /// Failures are collected and do not abort the remaining devices.
    pub fn reconnect_all(&self) -> ReconnectReport {
        let connected = self
            .connected_devices()
            .into_iter()
            .map(|device| device.id)
            .collect::<Vec<_>>();
        let mut report = ReconnectReport::default();
        for id in connected {
            if let Err(DisconnectError::DeviceNotFound(id)) = self.disconnect(id) {
                report.failed.push((id, ConnectError::DeviceNotFound(id)));
                continue;
            }
            match self.connect(id) {
                Ok(()) => report.reconnected.push(id),
                Err(err) => {
                    log::warn!("Failed to reconnect device {id}: {err}");
                    report.failed.push((id, err));
                }
            }
        }
        report
    }

    /// Encode and send an event to a connected device.
    pub fn send_event(&self, id: DeviceId, event: &MidiEvent) -> Result<(), SendError> {
        let mut registry = self.lock_registry();
        let entry = registry.get_mut(id).ok_or(SendError::DeviceNotFound(id))?;
        let Some(port) = entry.port_mut() else {
            return Err(SendError::DeviceNotConnected(id));
        };
        let msg = encode(event)?;
        log::trace!("Sending {event} to {id}: {msg:?}");
        self.shared
            .transport
            .send(port, msg.as_bytes())
            .map_err(|err| {
                log::warn!("Failed to send {event} to {id}: {err}");
                err.into()
            })
    }

    pub fn send_note_on(
        &self,
        id: DeviceId,
        channel: u8,
        note: u8,
        velocity: u8,
    ) -> Result<(), SendError> {
        self.send_event(
            id,
            &MidiEvent::NoteOn {
                channel,
                note,
                velocity,
            },
        )
    }

    pub fn send_note_off(
        &self,
        id: DeviceId,
        channel: u8,
        note: u8,
        velocity: u8,
    ) -> Result<(), SendError> {
        self.send_event(
            id,
            &MidiEvent::NoteOff {
                channel,
                note,
                velocity,
            },
        )
    }

    pub fn send_control_change(
        &self,
        id: DeviceId,
        channel: u8,
        controller: u8,
        value: u8,
    ) -> Result<(), SendError> {
        self.send_event(
            id,
            &MidiEvent::ControlChange {
                channel,
                controller,
                value,
            },
        )
    }

    pub fn send_program_change(
        &self,
        id: DeviceId,
        channel: u8,
        program: u8,
    ) -> Result<(), SendError> {
        self.send_event(id, &MidiEvent::ProgramChange { channel, program })
    }

    /// `value` is a 14-bit value, see [`crate::PITCH_BEND_CENTER`].
    pub fn send_pitch_bend(&self, id: DeviceId, channel: u8, value: u16) -> Result<(), SendError> {
        self.send_event(id, &MidiEvent::PitchBend { channel, value })
    }

    /// Queue an event for delivery as if it had been received.
    ///
    /// Returns `Ok(false)` if the event has been dropped because
    /// the queue is full.
    pub fn inject_event(&self, event: MidiEvent) -> Result<bool, InvalidArgument> {
        event.validate()?;
        Ok(self.shared.dispatcher.inject(event))
    }

    /// Deliver queued events to the sink.
    ///
    /// Supposed to be invoked periodically from a single host thread.
    /// Never blocks on input. The sink is only ever invoked from within
    /// this function. Events that arrive while delivering are left for
    /// the next invocation.
    pub fn poll_events<S>(&self, sink: &mut S) -> PollSummary
    where
        S: MidiEventSink + ?Sized,
    {
        let devices_changed = self.shared.topology_changed.swap(false, Ordering::AcqRel);
        if devices_changed {
            if self.shared.config.refresh_on_topology_change {
                match self.refresh() {
                    Ok(()) => {
                        let report = self.reconnect_all();
                        if !report.is_complete() {
                            log::warn!(
                                "Failed to reconnect {count} device(s)",
                                count = report.failed.len()
                            );
                        }
                    }
                    Err(err) => {
                        log::warn!("Failed to refresh MIDI devices: {err}");
                    }
                }
            }
            sink.devices_changed();
        }
        let delivered = drain_into(&self.shared.receiver, sink);
        PollSummary {
            delivered,
            devices_changed,
        }
    }

    #[must_use]
    pub fn inbound_stats(&self) -> InboundStats {
        self.shared.dispatcher.stats()
    }

    /// Close all ports and stop receiving input.
    ///
    /// Affects all handles of this session. Devices can no longer be
    /// connected afterwards, see [`ConnectError::SessionClosed`].
    pub fn shutdown(self) {
        log::info!("Shutting down MIDI session");
        self.shared.dispatcher.close();
        let released = self.lock_registry().disconnect_all();
        self.shared.release_ports(released);
    }
}
