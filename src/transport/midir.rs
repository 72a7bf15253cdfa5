// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Transport backed by [`midir`]
//!
//! Input and output ports with the same name are paired into a single
//! bidirectional device. Ports are identified by their name. Duplicate
//! names are disambiguated by appending a sequence number.

use std::{collections::HashMap, sync::Arc};

use midir::{
    ConnectError, Ignore, InitError, MidiInput, MidiInputConnection, MidiInputPort, MidiOutput,
    MidiOutputConnection, MidiOutputPort, SendError,
};
use parking_lot::{Mutex, RwLock};

use super::{
    MidiTransport, ReceiveCallback, TopologyChangedCallback, TransportDevice, TransportError,
};
use crate::{DeviceKind, NativeDeviceId};

impl From<InitError> for TransportError {
    fn from(err: InitError) -> Self {
        Self::new(err.to_string())
    }
}

impl<T> From<ConnectError<T>> for TransportError {
    fn from(err: ConnectError<T>) -> Self {
        Self::new(err.kind().to_string())
    }
}

impl From<SendError> for TransportError {
    fn from(err: SendError) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidirTransportConfig {
    /// Client name that is announced to the platform's MIDI system
    pub client_name: String,
}

impl Default for MidirTransportConfig {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

/// Open connections of a device
#[allow(missing_debug_implementations)]
pub struct MidirPort {
    native_id: NativeDeviceId,
    input: Option<MidiInputConnection<()>>,
    output: Option<MidiOutputConnection>,
}

impl MidirPort {
    #[must_use]
    pub fn native_id(&self) -> &NativeDeviceId {
        &self.native_id
    }
}

fn new_input(client_name: &str) -> Result<MidiInput, TransportError> {
    let mut input = MidiInput::new(client_name)?;
    // Filtering is done after splitting
    input.ignore(Ignore::None);
    Ok(input)
}

fn new_output(client_name: &str) -> Result<MidiOutput, TransportError> {
    MidiOutput::new(client_name).map_err(Into::into)
}

/// Long-lived clients for enumerating ports.
///
/// Connecting a port consumes the client, so connections use
/// their own clients.
struct PortWatcher {
    input: MidiInput,
    output: MidiOutput,
}

impl PortWatcher {
    fn new(client_name: &str) -> Result<Self, TransportError> {
        log::debug!("Creating MIDI clients for watching ports");
        Ok(Self {
            input: new_input(client_name)?,
            output: new_output(client_name)?,
        })
    }

    fn enumerate(&self) -> Vec<TransportDevice> {
        let input_names = input_ports(&self.input)
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        let output_names = output_ports(&self.output)
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        pair_ports(&input_names, &output_names)
    }
}

struct MidirTransportInner {
    config: MidirTransportConfig,
    receive_callback: Arc<RwLock<Option<ReceiveCallback>>>,
    topology_callback: RwLock<Option<TopologyChangedCallback>>,
    port_watcher: Mutex<Option<PortWatcher>>,
    last_topology: Mutex<Option<Vec<NativeDeviceId>>>,
    #[cfg(test)]
    port_watchers_created: std::sync::atomic::AtomicUsize,
}

/// MIDI transport driven by [`midir`].
///
/// Cloning is cheap and results in another handle of the same transport.
/// Topology changes are only detected when invoking [`Self::poll_topology()`],
/// see also [`crate::transport::watcher`].
#[derive(Clone)]
#[allow(missing_debug_implementations)]
pub struct MidirTransport {
    inner: Arc<MidirTransportInner>,
}

/// Assign unique names in order of appearance.
fn unique_port_names(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut occurrences = HashMap::<String, usize>::new();
    names
        .into_iter()
        .map(|name| {
            let count = occurrences.entry(name.clone()).or_default();
            *count += 1;
            if *count > 1 {
                format!("{name} #{count}")
            } else {
                name
            }
        })
        .collect()
}

/// Pair input and output ports by name.
///
/// Devices are ordered by first appearance, inputs before outputs.
fn pair_ports(input_names: &[String], output_names: &[String]) -> Vec<TransportDevice> {
    let mut devices = Vec::<TransportDevice>::with_capacity(input_names.len());
    let mut add_port = |name: &String, is_input: bool| {
        if let Some(device) = devices.iter_mut().find(|device| device.name == *name) {
            let input = device.kind.is_input() || is_input;
            let output = device.kind.is_output() || !is_input;
            if let Some(kind) = DeviceKind::from_directions(input, output) {
                device.kind = kind;
            }
            return;
        }
        let Some(kind) = DeviceKind::from_directions(is_input, !is_input) else {
            return;
        };
        devices.push(TransportDevice {
            native_id: name.as_str().into(),
            name: name.clone(),
            kind,
        });
    };
    for name in input_names {
        add_port(name, true);
    }
    for name in output_names {
        add_port(name, false);
    }
    devices
}

fn input_ports(input: &MidiInput) -> Vec<(String, MidiInputPort)> {
    let (names, ports): (Vec<_>, Vec<_>) = input
        .ports()
        .into_iter()
        .filter_map(|port| {
            input
                .port_name(&port)
                .map_err(|err| log::warn!("Failed to query name of MIDI input port: {err}"))
                .ok()
                .map(|name| (name, port))
        })
        .unzip();
    unique_port_names(names).into_iter().zip(ports).collect()
}

fn output_ports(output: &MidiOutput) -> Vec<(String, MidiOutputPort)> {
    let (names, ports): (Vec<_>, Vec<_>) = output
        .ports()
        .into_iter()
        .filter_map(|port| {
            output
                .port_name(&port)
                .map_err(|err| log::warn!("Failed to query name of MIDI output port: {err}"))
                .ok()
                .map(|name| (name, port))
        })
        .unzip();
    unique_port_names(names).into_iter().zip(ports).collect()
}

impl MidirTransport {
    #[must_use]
    pub fn new(config: MidirTransportConfig) -> Self {
        Self {
            inner: Arc::new(MidirTransportInner {
                config,
                receive_callback: Default::default(),
                topology_callback: Default::default(),
                port_watcher: Default::default(),
                last_topology: Default::default(),
                #[cfg(test)]
                port_watchers_created: Default::default(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MidirTransportConfig {
        &self.inner.config
    }

    fn enumerate(&self) -> Result<Vec<TransportDevice>, TransportError> {
        let mut port_watcher = self.inner.port_watcher.lock();
        let watcher = match port_watcher.take() {
            Some(watcher) => watcher,
            None => {
                let watcher = PortWatcher::new(&self.inner.config.client_name)?;
                #[cfg(test)]
                self.inner
                    .port_watchers_created
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                watcher
            }
        };
        let devices = watcher.enumerate();
        *port_watcher = Some(watcher);
        Ok(devices)
    }

    /// Detect added or removed devices.
    ///
    /// Invokes the registered topology callback and returns `true`
    /// if the devices have changed since the last invocation. The
    /// first invocation only records the current devices.
    pub fn poll_topology(&self) -> Result<bool, TransportError> {
        let current = self
            .enumerate()?
            .into_iter()
            .map(|device| device.native_id)
            .collect::<Vec<_>>();
        let changed = {
            let mut last_topology = self.inner.last_topology.lock();
            let changed = last_topology
                .as_ref()
                .is_some_and(|last_topology| *last_topology != current);
            *last_topology = Some(current);
            changed
        };
        if changed {
            log::info!("MIDI ports have changed");
            let callback = self.inner.topology_callback.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
        Ok(changed)
    }

    fn connect_input(
        &self,
        native_id: &NativeDeviceId,
    ) -> Result<MidiInputConnection<()>, TransportError> {
        let input = new_input(&self.inner.config.client_name)?;
        let Some((_, port)) = input_ports(&input)
            .into_iter()
            .find(|(name, _)| name == native_id.as_str())
        else {
            return Err(TransportError::new(format!(
                "MIDI input port {native_id} not found"
            )));
        };
        let receive_callback = Arc::clone(&self.inner.receive_callback);
        let source = native_id.clone();
        input
            .connect(
                &port,
                native_id.as_str(),
                move |micros, input, _: &mut ()| {
                    log::trace!("Received MIDI input from {source} @ {micros} us: {input:02x?}");
                    let callback = receive_callback.read().clone();
                    if let Some(callback) = callback {
                        callback(&source, input);
                    }
                },
                (),
            )
            .map_err(Into::into)
    }

    fn connect_output(
        &self,
        native_id: &NativeDeviceId,
    ) -> Result<MidiOutputConnection, TransportError> {
        let output = new_output(&self.inner.config.client_name)?;
        let Some((_, port)) = output_ports(&output)
            .into_iter()
            .find(|(name, _)| name == native_id.as_str())
        else {
            return Err(TransportError::new(format!(
                "MIDI output port {native_id} not found"
            )));
        };
        output.connect(&port, native_id.as_str()).map_err(Into::into)
    }
}

impl Default for MidirTransport {
    fn default() -> Self {
        Self::new(MidirTransportConfig::default())
    }
}

impl MidiTransport for MidirTransport {
    type Port = MidirPort;

    fn list_devices(&self) -> Result<Vec<TransportDevice>, TransportError> {
        let devices = self.enumerate()?;
        *self.inner.last_topology.lock() =
            Some(devices.iter().map(|device| device.native_id.clone()).collect());
        Ok(devices)
    }

    fn open_port(
        &self,
        native_id: &NativeDeviceId,
        direction: DeviceKind,
    ) -> Result<Self::Port, TransportError> {
        let output = direction
            .is_output()
            .then(|| self.connect_output(native_id))
            .transpose()?;
        // The output connection is closed when dropped
        let input = direction
            .is_input()
            .then(|| self.connect_input(native_id))
            .transpose()?;
        Ok(MidirPort {
            native_id: native_id.clone(),
            input,
            output,
        })
    }

    fn close_port(&self, port: Self::Port) {
        let MidirPort {
            native_id,
            input,
            output,
        } = port;
        if let Some(input) = input {
            input.close();
        }
        if let Some(output) = output {
            output.close();
        }
        log::debug!("Closed MIDI port(s) of {native_id}");
    }

    fn send(&self, port: &mut Self::Port, bytes: &[u8]) -> Result<(), TransportError> {
        let Some(output) = &mut port.output else {
            return Err(TransportError::new(format!(
                "{native_id} has no MIDI output port",
                native_id = port.native_id
            )));
        };
        output.send(bytes).map_err(Into::into)
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) {
        *self.inner.receive_callback.write() = Some(callback);
    }

    fn register_topology_changed_callback(&self, callback: TopologyChangedCallback) {
        *self.inner.topology_callback.write() = Some(callback);
    }
}
