// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Platform MIDI transport capability

use std::{borrow::Cow, sync::Arc};

use thiserror::Error;

use crate::{DeviceKind, NativeDeviceId};

#[cfg(feature = "midir")]
pub mod midir;

#[cfg(feature = "topology-watcher")]
pub mod watcher;

#[cfg(test)]
pub(crate) mod mock;

/// Opaque failure of the underlying driver.
#[derive(Debug, Clone, Error)]
#[error("{msg}")]
pub struct TransportError {
    msg: Cow<'static, str>,
}

impl TransportError {
    #[must_use]
    pub fn new(msg: impl Into<Cow<'static, str>>) -> Self {
        Self { msg: msg.into() }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.msg
    }
}

/// A device as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDevice {
    pub native_id: NativeDeviceId,
    pub name: String,
    pub kind: DeviceKind,
}

/// Invoked on the transport's notification thread for each batch
/// of received bytes.
pub type ReceiveCallback = Arc<dyn Fn(&NativeDeviceId, &[u8]) + Send + Sync + 'static>;

/// Invoked on an arbitrary thread when devices have been added or removed.
pub type TopologyChangedCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Capabilities of a platform MIDI driver.
///
/// Implementations must not invoke any of the registered callbacks while
/// holding locks that are also acquired by the other functions.
pub trait MidiTransport: Send + Sync {
    /// Exclusive handle of an opened device.
    type Port: Send;

    /// Enumerate all available devices.
    ///
    /// Native ids are supposed to be unique and stable. Devices with
    /// a native id that has already been listed are ignored.
    fn list_devices(&self) -> Result<Vec<TransportDevice>, TransportError>;

    /// Open the ports of a device for the given direction(s).
    ///
    /// Received input is forwarded to the registered receive callback
    /// until the port is closed.
    fn open_port(
        &self,
        native_id: &NativeDeviceId,
        direction: DeviceKind,
    ) -> Result<Self::Port, TransportError>;

    fn close_port(&self, port: Self::Port);

    fn send(&self, port: &mut Self::Port, bytes: &[u8]) -> Result<(), TransportError>;

    /// Replaces any previously registered receive callback.
    fn register_receive_callback(&self, callback: ReceiveCallback);

    /// Replaces any previously registered topology callback.
    fn register_topology_changed_callback(&self, callback: TopologyChangedCallback);
}

impl<T> MidiTransport for Arc<T>
where
    T: MidiTransport + ?Sized,
{
    type Port = T::Port;

    fn list_devices(&self) -> Result<Vec<TransportDevice>, TransportError> {
        T::list_devices(self)
    }

    fn open_port(
        &self,
        native_id: &NativeDeviceId,
        direction: DeviceKind,
    ) -> Result<Self::Port, TransportError> {
        T::open_port(self, native_id, direction)
    }

    fn close_port(&self, port: Self::Port) {
        T::close_port(self, port);
    }

    fn send(&self, port: &mut Self::Port, bytes: &[u8]) -> Result<(), TransportError> {
        T::send(self, port, bytes)
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) {
        T::register_receive_callback(self, callback);
    }

    fn register_topology_changed_callback(&self, callback: TopologyChangedCallback) {
        T::register_topology_changed_callback(self, callback);
    }
}
