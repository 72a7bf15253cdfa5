// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! In-memory transport for tests

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};

use super::{
    MidiTransport, ReceiveCallback, TopologyChangedCallback, TransportDevice, TransportError,
};
use crate::{DeviceKind, NativeDeviceId};

#[derive(Debug)]
pub(crate) struct MockPort {
    id: u64,
    native_id: NativeDeviceId,
    direction: DeviceKind,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<TransportDevice>,
    next_port_id: u64,
    open_ports: HashMap<u64, NativeDeviceId>,
    open_count: usize,
    close_count: usize,
    sent: Vec<(NativeDeviceId, Vec<u8>)>,
    failing_opens: HashSet<NativeDeviceId>,
    failing_sends: bool,
    failing_list: bool,
    open_delay: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    state: Mutex<MockState>,
    receive_callback: RwLock<Option<ReceiveCallback>>,
    topology_callback: RwLock<Option<TopologyChangedCallback>>,
}

impl MockTransport {
    pub(crate) fn with_devices(devices: &[(&str, DeviceKind)]) -> Self {
        let transport = Self::default();
        transport.set_devices(devices);
        transport
    }

    /// Replace the devices without notifying anyone.
    pub(crate) fn set_devices(&self, devices: &[(&str, DeviceKind)]) {
        self.state.lock().devices = devices
            .iter()
            .map(|&(name, kind)| TransportDevice {
                native_id: format!("mock:{name}").into(),
                name: name.to_owned(),
                kind,
            })
            .collect();
    }

    pub(crate) fn native_id(name: &str) -> NativeDeviceId {
        format!("mock:{name}").into()
    }

    pub(crate) fn fail_open(&self, name: &str, fail: bool) {
        let native_id = Self::native_id(name);
        let mut state = self.state.lock();
        if fail {
            state.failing_opens.insert(native_id);
        } else {
            state.failing_opens.remove(&native_id);
        }
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.state.lock().failing_sends = fail;
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.state.lock().failing_list = fail;
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = Some(delay);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    pub(crate) fn open_port_count(&self, name: &str) -> usize {
        let native_id = Self::native_id(name);
        self.state
            .lock()
            .open_ports
            .values()
            .filter(|open| **open == native_id)
            .count()
    }

    pub(crate) fn take_sent(&self) -> Vec<(NativeDeviceId, Vec<u8>)> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Simulate input from the driver on the current thread.
    pub(crate) fn receive(&self, name: &str, bytes: &[u8]) {
        let callback = self.receive_callback.read().clone();
        if let Some(callback) = callback {
            callback(&Self::native_id(name), bytes);
        }
    }

    pub(crate) fn notify_topology_changed(&self) {
        let callback = self.topology_callback.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl MidiTransport for MockTransport {
    type Port = MockPort;

    fn list_devices(&self) -> Result<Vec<TransportDevice>, TransportError> {
        let state = self.state.lock();
        if state.failing_list {
            return Err(TransportError::new("enumeration failed"));
        }
        Ok(state.devices.clone())
    }

    fn open_port(
        &self,
        native_id: &NativeDeviceId,
        direction: DeviceKind,
    ) -> Result<Self::Port, TransportError> {
        let delay = self.state.lock().open_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock();
        if state.failing_opens.contains(native_id) {
            return Err(TransportError::new(format!("failed to open {native_id}")));
        }
        if !state
            .devices
            .iter()
            .any(|device| device.native_id == *native_id)
        {
            return Err(TransportError::new(format!("no such device {native_id}")));
        }
        let id = state.next_port_id;
        state.next_port_id += 1;
        state.open_count += 1;
        state.open_ports.insert(id, native_id.clone());
        Ok(MockPort {
            id,
            native_id: native_id.clone(),
            direction,
        })
    }

    fn close_port(&self, port: Self::Port) {
        let mut state = self.state.lock();
        let closed = state.open_ports.remove(&port.id);
        assert!(closed.is_some(), "port closed twice");
        state.close_count += 1;
    }

    fn send(&self, port: &mut Self::Port, bytes: &[u8]) -> Result<(), TransportError> {
        if !port.direction.is_output() {
            return Err(TransportError::new("not an output port"));
        }
        let mut state = self.state.lock();
        if state.failing_sends {
            return Err(TransportError::new("send failed"));
        }
        state.sent.push((port.native_id.clone(), bytes.to_vec()));
        Ok(())
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) {
        *self.receive_callback.write() = Some(callback);
    }

    fn register_topology_changed_callback(&self, callback: TopologyChangedCallback) {
        *self.topology_callback.write() = Some(callback);
    }
}
