use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::ble::{BleDeviceConnection, BleLink, LinkEvent, LinkEventStream};
use crate::connection::ConnectionStateMachine;
use crate::error::DeviceExchangeError;

const RECONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Bridges platform link events and reconnection requests into the
/// connection state machine.
#[derive(Debug)]
pub(crate) struct LinkSupervisor {
    link: Arc<dyn BleLink>,
    connection: Arc<BleDeviceConnection>,
    machine: ConnectionStateMachine<BleDeviceConnection>,
    reconnect_requests: mpsc::UnboundedReceiver<Duration>,
    cancel: CancellationToken,
}

impl LinkSupervisor {
    pub(crate) fn new(
        link: Arc<dyn BleLink>,
        connection: Arc<BleDeviceConnection>,
        machine: ConnectionStateMachine<BleDeviceConnection>,
        reconnect_requests: mpsc::UnboundedReceiver<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link,
            connection,
            machine,
            reconnect_requests,
            cancel,
        }
    }

    pub(crate) fn spawn(self, events: LinkEventStream) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    #[instrument(skip_all, level = "debug", fields(device_id = %self.machine.device_id()))]
    async fn run(mut self, mut events: LinkEventStream) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("link supervisor cancelled");
                    break;
                }
                event = events.next() => match event {
                    Some(LinkEvent::Disconnected) => self.on_link_lost().await,
                    Some(LinkEvent::Connected) => trace!("link connected"),
                    None => {
                        debug!("link event stream ended");
                        break;
                    }
                },
                request = self.reconnect_requests.recv() => match request {
                    Some(timeout) => self.reconnect_within(timeout).await,
                    None => break,
                },
            }
        }
    }

    async fn on_link_lost(&self) {
        match self.link.is_connected().await {
            Ok(true) => trace!("ignoring stale disconnect event"),
            Ok(false) | Err(_) => {
                info!("device link lost");
                self.machine.event_device_detached();
            }
        }
    }

    // The machine's own timer terminates the connection if this loop gives up.
    async fn reconnect_within(&self, timeout: Duration) {
        let attempts = async {
            let mut attempt = 1_u32;
            loop {
                match self.connection.reconnect().await {
                    Ok(()) => return,
                    Err(error) => {
                        debug!(%error, attempt, "reconnect attempt failed");
                        tokio::time::sleep(RECONNECT_RETRY_INTERVAL).await;
                        attempt += 1;
                    }
                }
            }
        };

        let outcome = tokio::select! {
            () = self.cancel.cancelled() => return,
            outcome = tokio::time::timeout(timeout, attempts) => outcome,
        };
        match outcome {
            Ok(()) => self.machine.event_device_attached(),
            Err(_) => {
                warn!(
                    error = %DeviceExchangeError::ReconnectionFailed,
                    timeout = %humantime::format_duration(timeout),
                    "device did not come back in time"
                );
                self.connection.disconnect();
            }
        }
    }
}
