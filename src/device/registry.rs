// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use std::collections::{HashMap, HashSet};

use super::{ConnectionState, Device, DeviceId, Generation, NativeDeviceId};
use crate::transport::TransportDevice;

/// Registered device with its exclusively owned port.
#[derive(Debug)]
pub(crate) struct DeviceEntry<P> {
    device: Device,
    port: Option<P>,
}

impl<P> DeviceEntry<P> {
    const fn new(device: Device) -> Self {
        Self { device, port: None }
    }

    pub(crate) const fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) const fn state(&self) -> ConnectionState {
        self.device.connection_state
    }

    pub(crate) fn port_mut(&mut self) -> Option<&mut P> {
        debug_assert_eq!(
            self.port.is_some(),
            self.state() == ConnectionState::Connected
        );
        self.port.as_mut()
    }

    pub(crate) fn begin_connect(&mut self) {
        debug_assert_eq!(self.state(), ConnectionState::Disconnected);
        debug_assert!(self.port.is_none());
        self.device.connection_state = ConnectionState::Connecting;
    }

    pub(crate) fn complete_connect(&mut self, port: P) {
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        debug_assert!(self.port.is_none());
        self.port = Some(port);
        self.device.connection_state = ConnectionState::Connected;
    }

    pub(crate) fn abort_connect(&mut self) {
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        self.device.connection_state = ConnectionState::Disconnected;
    }

    /// Returns the port that needs to be closed.
    pub(crate) fn begin_disconnect(&mut self) -> Option<P> {
        debug_assert_eq!(self.state(), ConnectionState::Connected);
        self.device.connection_state = ConnectionState::Disconnecting;
        self.port.take()
    }

    pub(crate) fn complete_disconnect(&mut self) {
        debug_assert_eq!(self.state(), ConnectionState::Disconnecting);
        debug_assert!(self.port.is_none());
        self.device.connection_state = ConnectionState::Disconnected;
    }

    /// Returns the port that needs to be closed.
    fn force_disconnect(&mut self) -> Option<P> {
        self.device.connection_state = ConnectionState::Disconnected;
        self.port.take()
    }
}

/// Arena of the devices of the current enumeration generation.
#[derive(Debug)]
pub(crate) struct DeviceRegistry<P> {
    generation: Generation,
    entries: Vec<DeviceEntry<P>>,
}

impl<P> Default for DeviceRegistry<P> {
    fn default() -> Self {
        Self {
            generation: Generation::INITIAL,
            entries: Vec::new(),
        }
    }
}

impl<P> DeviceRegistry<P> {
    pub(crate) const fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn devices(&self) -> impl Iterator<Item = &Device> {
        self.entries.iter().map(DeviceEntry::device)
    }

    pub(crate) fn id_at(&self, index: usize) -> Option<DeviceId> {
        (index < self.entries.len()).then(|| DeviceId::new(self.generation, index))
    }

    #[must_use]
    pub(crate) fn get(&self, id: DeviceId) -> Option<&DeviceEntry<P>> {
        if id.generation() != self.generation {
            return None;
        }
        self.entries.get(id.index())
    }

    #[must_use]
    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Option<&mut DeviceEntry<P>> {
        if id.generation() != self.generation {
            return None;
        }
        self.entries.get_mut(id.index())
    }

    /// Look up a device by the id it has been issued with, or by its
    /// native id if it has been re-enumerated since.
    #[must_use]
    pub(crate) fn resolve_mut(
        &mut self,
        id: DeviceId,
        native_id: &NativeDeviceId,
    ) -> Option<&mut DeviceEntry<P>> {
        if self
            .get(id)
            .is_some_and(|entry| entry.device.native_id == *native_id)
        {
            return self.get_mut(id);
        }
        self.find_mut(native_id)
    }

    /// Look up a device independent of the generation.
    #[must_use]
    pub(crate) fn find_mut(&mut self, native_id: &NativeDeviceId) -> Option<&mut DeviceEntry<P>> {
        self.entries
            .iter_mut()
            .find(|entry| entry.device.native_id == *native_id)
    }

    /// Replace all entries with a new enumeration.
    ///
    /// Devices that are still present keep their connection state
    /// and port. Returns the ports of connected devices that have
    /// vanished, which must be closed by the caller.
    ///
    /// Native ids must be unique. Only the first of multiple devices
    /// with the same native id is registered.
    pub(crate) fn replace(&mut self, listed: Vec<TransportDevice>) -> Vec<(Device, P)> {
        let generation = self.generation.next();
        let mut previous = self
            .entries
            .drain(..)
            .map(|entry| (entry.device.native_id.clone(), entry))
            .collect::<HashMap<_, _>>();
        let mut registered = HashSet::with_capacity(listed.len());
        self.entries = listed
            .into_iter()
            .filter(|listed| {
                if registered.insert(listed.native_id.clone()) {
                    return true;
                }
                log::warn!(
                    "Ignoring device \"{name}\" with duplicate native id {native_id}",
                    name = listed.name,
                    native_id = listed.native_id
                );
                false
            })
            .enumerate()
            .map(|(index, listed)| {
                let TransportDevice {
                    native_id,
                    name,
                    kind,
                } = listed;
                let id = DeviceId::new(generation, index);
                if let Some(mut entry) = previous.remove(&native_id) {
                    if entry.device.kind != kind {
                        log::info!(
                            "Device \"{name}\" changed from {old_kind} to {kind}",
                            old_kind = entry.device.kind
                        );
                    }
                    entry.device.id = id;
                    entry.device.name = name;
                    entry.device.kind = kind;
                    return entry;
                }
                log::debug!("Found {kind} device \"{name}\" ({native_id})");
                DeviceEntry::new(Device {
                    id,
                    native_id,
                    name,
                    kind,
                    connection_state: ConnectionState::Disconnected,
                })
            })
            .collect();
        self.generation = generation;
        previous
            .into_values()
            .filter_map(|mut entry| {
                let state = entry.state();
                log::debug!(
                    "Device \"{name}\" has vanished while {state}",
                    name = entry.device.name
                );
                let port = entry.force_disconnect()?;
                Some((entry.device, port))
            })
            .collect()
    }

    /// Take the ports of all connected devices.
    ///
    /// Devices in a transitional state are not affected.
    pub(crate) fn disconnect_all(&mut self) -> Vec<(Device, P)> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.state() == ConnectionState::Connected)
            .filter_map(|entry| {
                let port = entry.force_disconnect()?;
                Some((entry.device.clone(), port))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceKind;

    fn listed(native_id: &str, kind: DeviceKind) -> TransportDevice {
        TransportDevice {
            native_id: native_id.into(),
            name: native_id.to_uppercase(),
            kind,
        }
    }

    #[test]
    fn ids_are_scoped_by_generation() {
        let mut registry = DeviceRegistry::<u32>::default();
        assert!(registry.id_at(0).is_none());
        assert!(registry
            .replace(vec![
                listed("a", DeviceKind::Input),
                listed("b", DeviceKind::Output)
            ])
            .is_empty());
        let a = registry.id_at(0).unwrap();
        let b = registry.id_at(1).unwrap();
        assert!(registry.id_at(2).is_none());
        assert_eq!("A", registry.get(a).unwrap().device().name);
        assert_eq!("B", registry.get(b).unwrap().device().name);

        registry.replace(vec![
            listed("b", DeviceKind::Output),
            listed("a", DeviceKind::Input),
        ]);
        assert!(registry.get(a).is_none());
        assert!(registry.get(b).is_none());
        let b_renumbered = registry.id_at(0).unwrap();
        assert_eq!(b.index(), 1);
        assert_eq!(b_renumbered.index(), 0);
        assert_eq!("B", registry.get(b_renumbered).unwrap().device().name);
    }

    #[test]
    fn replace_keeps_connected_devices() {
        let mut registry = DeviceRegistry::<u32>::default();
        registry.replace(vec![
            listed("a", DeviceKind::Bidirectional),
            listed("b", DeviceKind::Input),
        ]);
        for index in 0..2 {
            let entry = registry.get_mut(registry.id_at(index).unwrap()).unwrap();
            entry.begin_connect();
            #[allow(clippy::cast_possible_truncation)]
            entry.complete_connect(index as u32 + 10);
        }

        let released = registry.replace(vec![listed("a", DeviceKind::Bidirectional)]);
        assert_eq!(1, released.len());
        let (vanished, port) = &released[0];
        assert_eq!("b", vanished.native_id.as_str());
        assert_eq!(ConnectionState::Disconnected, vanished.connection_state);
        assert_eq!(11, *port);

        let a = registry.id_at(0).unwrap();
        let entry = registry.get_mut(a).unwrap();
        assert_eq!(ConnectionState::Connected, entry.state());
        assert_eq!(a, entry.device().id);
        assert_eq!(Some(&mut 10), entry.port_mut());
    }

    #[test]
    fn duplicate_native_ids_are_registered_once() {
        let mut registry = DeviceRegistry::<u32>::default();
        registry.replace(vec![
            listed("a", DeviceKind::Input),
            listed("b", DeviceKind::Output),
            listed("a", DeviceKind::Output),
        ]);
        assert_eq!(
            vec!["a", "b"],
            registry
                .devices()
                .map(|device| device.native_id.as_str())
                .collect::<Vec<_>>()
        );
        assert!(registry.id_at(2).is_none());
        assert_eq!(
            DeviceKind::Input,
            registry.get(registry.id_at(0).unwrap()).unwrap().device().kind
        );

        let a = registry.id_at(0).unwrap();
        let entry = registry.get_mut(a).unwrap();
        entry.begin_connect();
        entry.complete_connect(1);
        // The port survives re-enumerating with duplicates
        assert!(registry
            .replace(vec![
                listed("a", DeviceKind::Input),
                listed("a", DeviceKind::Input)
            ])
            .is_empty());
        let entry = registry.get_mut(registry.id_at(0).unwrap()).unwrap();
        assert_eq!(Some(&mut 1), entry.port_mut());
        assert_eq!(1, registry.devices().count());
    }

    #[test]
    fn disconnect_all_releases_every_port() {
        let mut registry = DeviceRegistry::<u32>::default();
        registry.replace(vec![
            listed("a", DeviceKind::Input),
            listed("b", DeviceKind::Input),
        ]);
        let a = registry.id_at(0).unwrap();
        let entry = registry.get_mut(a).unwrap();
        entry.begin_connect();
        entry.complete_connect(1);

        let released = registry.disconnect_all();
        assert_eq!(1, released.len());
        assert!(registry.devices().all(|device| !device.is_connected()));
        assert!(registry.disconnect_all().is_empty());
    }
}
