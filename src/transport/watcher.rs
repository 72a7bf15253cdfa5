// SPDX-FileCopyrightText: The midi-bridge authors
// SPDX-License-Identifier: MPL-2.0

//! Periodic detection of added or removed devices
//!
//! Some platforms do not notify about changed ports. The watcher
//! polls the transport on a dedicated thread instead.

use std::time::Duration;

use futures_util::future::{AbortHandle, Abortable, Aborted};
use tokio::time::MissedTickBehavior;

use super::TransportError;

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(1);

async fn watch_topology<F>(period: Duration, mut poll_topology: F)
where
    F: FnMut() -> Result<bool, TransportError>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match poll_topology() {
            Ok(changed) => {
                if changed {
                    log::debug!("Detected changed MIDI devices");
                }
            }
            Err(err) => {
                log::warn!("Failed to poll MIDI devices: {err}");
            }
        }
    }
}

/// Dedicated thread that polls for changed devices.
#[derive(Debug)]
pub struct TopologyWatcher {
    abort_handle: AbortHandle,
    os_thread: std::thread::JoinHandle<()>,
}

impl TopologyWatcher {
    /// Spawn a thread that repeatedly invokes `poll_topology`.
    ///
    /// The first invocation happens immediately.
    #[must_use]
    pub fn spawn<F>(period: Duration, poll_topology: F) -> Self
    where
        F: FnMut() -> Result<bool, TransportError> + Send + 'static,
    {
        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let abortable_task =
            Abortable::new(watch_topology(period, poll_topology), abort_registration);
        let os_thread = std::thread::spawn(move || {
            log::info!("Entering topology watcher thread");
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    log::error!("Failed to create Tokio runtime: {err}");
                    return;
                }
            };
            runtime.block_on(async move {
                match abortable_task.await {
                    Ok(()) => {
                        log::info!("Topology watcher terminated");
                    }
                    Err(Aborted) => {
                        log::info!("Topology watcher aborted");
                    }
                }
            });
            log::info!("Exiting topology watcher thread");
        });
        Self {
            abort_handle,
            os_thread,
        }
    }

    /// Watch a [`MidirTransport`](super::midir::MidirTransport).
    #[must_use]
    pub fn spawn_midir(period: Duration, transport: super::midir::MidirTransport) -> Self {
        Self::spawn(period, move || transport.poll_topology())
    }

    pub fn abort_and_join(self) -> anyhow::Result<()> {
        let Self {
            abort_handle,
            os_thread,
        } = self;
        abort_handle.abort();
        os_thread
            .join()
            .map_err(|err| anyhow::anyhow!("Topology watcher thread panicked: {err:?}"))
    }
}
