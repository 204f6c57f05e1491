use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::btleplug_backend::BtleplugBackend;
use super::fake_backend::FakeDevice;
use super::model::FoundDevice;
use super::supervisor::LinkSupervisor;
use crate::apdu::{AppAndVersion, GET_APP_AND_VERSION};
use crate::ble::{BleDeviceConnection, BleDeviceConnectionParams, BleLink, CharacteristicPair};
use crate::config::ConnectionConfig;
use crate::connection::{
    ConnectionStateKind, ConnectionStateMachine, ConnectionStateMachineParams, DeviceApduSender,
    PendingResponse, ReconnectionHook, TerminationHook,
};
use crate::error::{DeviceExchangeError, LinkError};
use crate::protocol::CharacteristicIds;

/// Creates a hardware client that scans the platform BLE adapters.
pub(crate) async fn real_hardware_client() -> Result<Box<dyn HardwareClient>, LinkError> {
    Ok(Box::new(RealHardwareClient::new().await?))
}

/// Creates a hardware client that connects to the given fake device.
pub(crate) fn fake_hardware_client(device: FakeDevice) -> Box<dyn HardwareClient> {
    info!(name = device.name(), "using fake BLE backend");
    Box::new(FakeHardwareClient { device })
}

#[async_trait]
pub trait HardwareClient: Send + Sync {
    /// Connects to the first hardware wallet whose name starts with
    /// `name_prefix` and opens an APDU session on it.
    async fn connect_first_device(
        self: Box<Self>,
        name_prefix: &str,
        config: ConnectionConfig,
    ) -> Result<DeviceSession, DeviceExchangeError>;
}

/// A connected peripheral with resolved APDU endpoints.
#[derive(Debug)]
pub(crate) struct ConnectedDevice {
    pub(crate) device: FoundDevice,
    pub(crate) link: Arc<dyn BleLink>,
    pub(crate) characteristics: CharacteristicPair,
    pub(crate) characteristic_ids: CharacteristicIds,
}

#[derive(Debug)]
struct RealHardwareClient {
    backend: BtleplugBackend,
}

impl RealHardwareClient {
    async fn new() -> Result<Self, LinkError> {
        Ok(Self {
            backend: BtleplugBackend::new().await?,
        })
    }
}

#[async_trait]
impl HardwareClient for RealHardwareClient {
    async fn connect_first_device(
        self: Box<Self>,
        name_prefix: &str,
        config: ConnectionConfig,
    ) -> Result<DeviceSession, DeviceExchangeError> {
        let connected = self
            .backend
            .connect_first_matching_device(name_prefix)
            .await?;
        DeviceSession::establish(connected, config).await
    }
}

#[derive(Debug)]
struct FakeHardwareClient {
    device: FakeDevice,
}

#[async_trait]
impl HardwareClient for FakeHardwareClient {
    async fn connect_first_device(
        self: Box<Self>,
        name_prefix: &str,
        config: ConnectionConfig,
    ) -> Result<DeviceSession, DeviceExchangeError> {
        let Self { device } = *self;
        if !device.name().starts_with(name_prefix) {
            return Err(LinkError::NoMatchingFixtureDevice {
                prefix: name_prefix.to_string(),
            }
            .into());
        }

        let connected = ConnectedDevice {
            device: device.found_device(),
            link: device.link(),
            characteristics: device.characteristics()?,
            characteristic_ids: device.characteristic_ids(),
        };
        DeviceSession::establish(connected, config).await
    }
}

/// An open APDU session: the BLE connection, its state machine and the task
/// feeding link events into it.
#[derive(Debug)]
pub struct DeviceSession {
    device: FoundDevice,
    machine: ConnectionStateMachine<BleDeviceConnection>,
    terminated: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl DeviceSession {
    #[instrument(skip_all, level = "debug", fields(device_id = connected.device.device_id()))]
    pub(crate) async fn establish(
        connected: ConnectedDevice,
        config: ConnectionConfig,
    ) -> Result<Self, DeviceExchangeError> {
        let ConnectedDevice {
            device,
            link,
            characteristics,
            characteristic_ids,
        } = connected;

        let events = link.events().await?;
        let connection = Arc::new(BleDeviceConnection::new(
            BleDeviceConnectionParams::builder()
                .link(Arc::clone(&link))
                .characteristics(characteristics)
                .characteristic_ids(characteristic_ids)
                .config(config)
                .build(),
        ));
        connection.setup().await?;

        let terminated = CancellationToken::new();
        let (reconnect_requests, reconnect_receiver) = mpsc::unbounded_channel::<Duration>();
        let on_terminated: TerminationHook = {
            let terminated = terminated.clone();
            Arc::new(move || terminated.cancel())
        };
        let try_to_reconnect: ReconnectionHook = Arc::new(move |timeout| {
            if reconnect_requests.send(timeout).is_err() {
                debug!("link supervisor is gone, dropping reconnection request");
            }
        });

        let machine = ConnectionStateMachine::new(
            ConnectionStateMachineParams::builder()
                .device_id(device.device_id())
                .sender(Arc::clone(&connection))
                .timeout_duration(config.reconnection_timeout())
                .on_terminated(on_terminated)
                .try_to_reconnect(try_to_reconnect)
                .build(),
        );
        let supervisor = LinkSupervisor::new(
            link,
            connection,
            machine.clone(),
            reconnect_receiver,
            terminated.clone(),
        )
        .spawn(events);

        info!(device_id = device.device_id(), "device session established");
        Ok(Self {
            device,
            machine,
            terminated,
            supervisor,
        })
    }

    #[must_use]
    pub fn device(&self) -> &FoundDevice {
        &self.device
    }

    #[must_use]
    pub fn machine(&self) -> &ConnectionStateMachine<BleDeviceConnection> {
        &self.machine
    }

    #[must_use]
    pub fn state(&self) -> ConnectionStateKind {
        self.machine.state()
    }

    /// Submits one APDU through the connection state machine.
    pub fn send_apdu(
        &self,
        apdu: impl Into<Vec<u8>>,
        triggers_disconnection: bool,
        abort_timeout: Option<Duration>,
    ) -> PendingResponse {
        self.machine
            .send_apdu(apdu, triggers_disconnection, abort_timeout)
    }

    /// Asks the device which application is open.
    ///
    /// # Errors
    ///
    /// Returns the exchange failure, or [`anyhow::Error`] wrapping a decode
    /// failure when the payload is malformed.
    pub async fn app_and_version(
        &self,
        abort_timeout: Option<Duration>,
    ) -> anyhow::Result<AppAndVersion> {
        let response = self
            .send_apdu(GET_APP_AND_VERSION, false, abort_timeout)
            .await?;
        Ok(AppAndVersion::decode(&response)?)
    }

    /// Resolves once the connection has terminated.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    /// Terminates the connection and waits for the link to be released.
    #[instrument(skip_all, level = "debug", fields(device_id = self.device.device_id()))]
    pub async fn close(self) {
        self.machine.close_connection();
        // Cancelled by the termination hook once the adapter has closed.
        self.terminated.cancelled().await;
        if let Err(error) = self.supervisor.await {
            debug!(%error, "link supervisor task failed");
        }
    }
}
