// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Enumerated MIDI devices

use derive_more::{Display, From};
use strum::{EnumCount, EnumIter};

pub(crate) mod registry;

/// Enumeration generation
///
/// Incremented on every refresh of the device registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[repr(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const INITIAL: Self = Self(0);

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub(crate) const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Identifies a device within a single enumeration generation.
///
/// Devices are indexed in enumeration order. The index of a device
/// might change whenever devices are re-enumerated. Identifiers that
/// have been obtained before the last refresh are stale and will not
/// resolve to any device, even if a device with the same index exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{index}@{generation}")]
pub struct DeviceId {
    generation: Generation,
    index: usize,
}

impl DeviceId {
    #[must_use]
    pub(crate) const fn new(generation: Generation, index: usize) -> Self {
        Self { generation, index }
    }

    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// 0-based index in enumeration order
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }
}

/// Identifier assigned by the transport.
///
/// Used for matching devices across re-enumerations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From)]
pub struct NativeDeviceId(String);

impl NativeDeviceId {
    #[must_use]
    pub const fn new(inner: String) -> Self {
        Self(inner)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NativeDeviceId {
    fn from(from: &str) -> Self {
        Self(from.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, EnumIter, EnumCount)]
pub enum DeviceKind {
    Input,
    Output,
    Bidirectional,
}

impl DeviceKind {
    #[must_use]
    pub const fn is_input(self) -> bool {
        matches!(self, Self::Input | Self::Bidirectional)
    }

    #[must_use]
    pub const fn is_output(self) -> bool {
        matches!(self, Self::Output | Self::Bidirectional)
    }

    #[must_use]
    pub const fn from_directions(input: bool, output: bool) -> Option<Self> {
        match (input, output) {
            (true, true) => Some(Self::Bidirectional),
            (true, false) => Some(Self::Input),
            (false, true) => Some(Self::Output),
            (false, false) => None,
        }
    }
}

/// Connection state of a device
///
/// ```text
/// Disconnected --connect()--> Connecting --(port opened)--> Connected
/// Connecting --(open failed)--> Disconnected
/// Connected --disconnect()--> Disconnecting --(port closed)--> Disconnected
/// Connected --(device vanished)--> Disconnected
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display, EnumIter, EnumCount,
)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Pending until a concurrent transition has completed.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

/// Snapshot of an enumerated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub native_id: NativeDeviceId,
    pub name: String,
    pub kind: DeviceKind,
    pub connection_state: ConnectionState,
}

impl Device {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}
