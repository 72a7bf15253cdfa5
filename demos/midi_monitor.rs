// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

use std::{
    io::{stdin, stdout, Write as _},
    time::Duration,
};

use midi_bridge::{
    InboundEvent, MidiEventSink, MidiSession, MidirTransport, MidirTransportConfig,
    SessionConfig,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct PrintEvents;

impl MidiEventSink for PrintEvents {
    fn deliver_event(&mut self, event: InboundEvent) {
        let InboundEvent { source, event } = event;
        println!("{source:?}: {event}");
    }

    fn devices_changed(&mut self) {
        println!("MIDI devices have changed");
    }
}

fn main() {
    pretty_env_logger::init();
    match run() {
        Ok(()) => (),
        Err(err) => println!("Error: {err}"),
    }
}

fn run() -> anyhow::Result<()> {
    let transport = MidirTransport::new(MidirTransportConfig {
        client_name: "midi-monitor".to_owned(),
    });
    let session = MidiSession::start(transport.clone(), SessionConfig::default())?;
    let devices = session.list_devices();
    let device = match devices.len() {
        0 => anyhow::bail!("No MIDI devices found"),
        1 => {
            println!(
                "Choosing the only available device: {device_name}",
                device_name = devices[0].name,
            );
            &devices[0]
        }
        _ => {
            println!("\nAvailable devices:");
            for device in &devices {
                println!(
                    "{device_number}: {device_name} ({device_kind})",
                    device_number = device.id.index() + 1,
                    device_name = device.name,
                    device_kind = device.kind,
                );
            }
            print!("Please select a device: ");
            stdout().flush()?;
            let mut input = String::new();
            stdin().read_line(&mut input)?;
            let device_number = input.trim().parse::<usize>()?;
            if device_number < 1 || device_number > devices.len() {
                anyhow::bail!("Unknown device number {device_number}");
            }
            &devices[device_number - 1]
        }
    };

    println!("{device_name}: connecting", device_name = device.name);
    session.connect(device.id)?;

    #[cfg(feature = "topology-watcher")]
    let watcher = midi_bridge::transport::watcher::TopologyWatcher::spawn_midir(
        midi_bridge::transport::watcher::DEFAULT_POLL_PERIOD,
        transport,
    );
    #[cfg(not(feature = "topology-watcher"))]
    drop(transport);

    println!("Starting endless loop, press CTRL-C to exit...");
    let mut sink = PrintEvents;
    loop {
        let summary = session.poll_events(&mut sink);
        if summary.devices_changed && session.connected_devices().is_empty() {
            println!("{device_name}: disconnected", device_name = device.name);
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    #[cfg(feature = "topology-watcher")]
    watcher.abort_and_join()?;
    let stats = session.inbound_stats();
    log::info!("Inbound statistics: {stats:?}");
    session.shutdown();
    Ok(())
}
