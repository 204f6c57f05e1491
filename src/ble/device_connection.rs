use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tracing::{debug, error, info, instrument, warn};

use super::characteristic::{BleLink, CharacteristicIo, CharacteristicPair};
use super::exchange::ApduExchange;
use super::gate::ReconnectionGate;
use super::mtu::MtuNegotiator;
use crate::apdu::ApduResponse;
use crate::config::ConnectionConfig;
use crate::connection::DeviceApduSender;
use crate::error::DeviceExchangeError;
use crate::framing::Framing;
use crate::protocol::CharacteristicIds;
use crate::utils::format_hex;

const MAX_EXCHANGE_ATTEMPTS: u32 = 2;

/// Inputs for [`BleDeviceConnection::new`].
#[derive(Debug, Builder)]
pub struct BleDeviceConnectionParams {
    link: Arc<dyn BleLink>,
    characteristics: CharacteristicPair,
    characteristic_ids: CharacteristicIds,
    #[builder(default)]
    framing: Framing,
    #[builder(default)]
    config: ConnectionConfig,
}

/// BLE realisation of [`DeviceApduSender`].
///
/// Composes characteristic I/O, MTU negotiation, the frame-level exchange and
/// the reconnection gate. Retries are internal: callers see one outcome per
/// `send_apdu` call.
#[derive(Debug)]
pub struct BleDeviceConnection {
    link: Arc<dyn BleLink>,
    characteristic_ids: CharacteristicIds,
    io: Arc<CharacteristicIo>,
    negotiator: Arc<MtuNegotiator>,
    exchange: ApduExchange,
    gate: ReconnectionGate,
    config: ConnectionConfig,
}

impl BleDeviceConnection {
    #[must_use]
    pub fn new(params: BleDeviceConnectionParams) -> Self {
        let BleDeviceConnectionParams {
            link,
            characteristics,
            characteristic_ids,
            framing,
            config,
        } = params;

        let io = Arc::new(CharacteristicIo::new(Arc::clone(&link), characteristics));
        let negotiator = Arc::new(MtuNegotiator::new(
            Arc::clone(&io),
            framing.sender,
            config.negotiation_timeout(),
        ));
        let exchange = ApduExchange::new(
            Arc::clone(&io),
            Arc::clone(&negotiator),
            (framing.receiver)(),
        );

        Self {
            link,
            characteristic_ids,
            io,
            negotiator,
            exchange,
            gate: ReconnectionGate::new(),
            config,
        }
    }

    /// Connects the link if needed, negotiates the MTU and attaches the
    /// exchange listener.
    ///
    /// # Errors
    ///
    /// Returns the link or negotiation failure.
    #[instrument(skip(self), level = "debug")]
    pub async fn setup(&self) -> Result<(), DeviceExchangeError> {
        if !self.link.is_connected().await? {
            debug!("link is down during setup, connecting");
            self.link.connect().await?;
        }
        if let Err(error) = self.negotiator.negotiate().await {
            error!(%error, "MTU negotiation failed");
            return Err(error);
        }
        self.exchange.attach();
        Ok(())
    }

    /// Sends one APDU with the bounded retry policy.
    ///
    /// A generic exchange failure is retried once after a linear backoff. A
    /// missing frame size re-runs [`setup`](Self::setup) once and retries. When
    /// `triggers_disconnection` is set and the response is a success, the call
    /// returns only after the reconnect flow settles the gate.
    ///
    /// # Errors
    ///
    /// Returns the last exchange failure.
    #[instrument(
        skip(self, apdu),
        level = "debug",
        fields(apdu = %format_hex(apdu))
    )]
    pub async fn send_apdu(
        &self,
        apdu: &[u8],
        triggers_disconnection: bool,
        abort_timeout: Option<Duration>,
    ) -> Result<ApduResponse, DeviceExchangeError> {
        let mut attempt = 1;
        loop {
            let error = match self
                .send_once(apdu, triggers_disconnection, abort_timeout)
                .await
            {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            match error {
                DeviceExchangeError::UnknownDeviceExchange { reason }
                    if attempt < MAX_EXCHANGE_ATTEMPTS =>
                {
                    let backoff = self.config.retry_backoff() * attempt;
                    debug!(%reason, attempt, ?backoff, "retrying APDU exchange");
                    tokio::time::sleep(backoff).await;
                }
                DeviceExchangeError::DeviceNotInitialized { reason }
                    if attempt < MAX_EXCHANGE_ATTEMPTS =>
                {
                    debug!(%reason, attempt, "device not initialised, rerunning setup");
                    self.setup().await?;
                }
                error => return Err(error),
            }
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        apdu: &[u8],
        triggers_disconnection: bool,
        abort_timeout: Option<Duration>,
    ) -> Result<ApduResponse, DeviceExchangeError> {
        if !self.link.is_connected().await? {
            warn!("link is down, not sending APDU");
            return Err(DeviceExchangeError::ReconnectionFailed);
        }
        if !self.negotiator.ready_state() {
            return Err(DeviceExchangeError::not_initialized("frame size is unknown"));
        }

        // Registered before the first write so a fast reconnect cannot be missed.
        let reconnection = triggers_disconnection.then(|| self.gate.wait());
        let response = self.exchange.send(apdu, abort_timeout).await?;
        if let Some(reconnection) = reconnection
            && response.is_success()
        {
            debug!("waiting for the device to reconnect");
            reconnection.await?;
        }
        Ok(response)
    }

    /// Rebuilds the session after the physical link came back, then resolves
    /// the reconnection gate.
    ///
    /// # Errors
    ///
    /// Returns the failure of any reconnect step. The gate stays pending so a
    /// later attempt can still resolve it; [`disconnect`](Self::disconnect)
    /// rejects it.
    #[instrument(skip(self), level = "info")]
    pub async fn reconnect(&self) -> Result<(), DeviceExchangeError> {
        if let Err(error) = self.reconnect_steps().await {
            warn!(%error, "reconnection attempt failed");
            return Err(error);
        }
        info!("device reconnected");
        self.gate.resolve();
        Ok(())
    }

    async fn reconnect_steps(&self) -> Result<(), DeviceExchangeError> {
        self.negotiator.reset();
        self.exchange
            .fail_pending(DeviceExchangeError::DeviceDisconnectedWhileSending);
        self.exchange.detach();
        self.exchange.reset_receiver();

        if !self.link.is_connected().await? {
            self.link.connect().await?;
        }
        let characteristics = self
            .link
            .acquire_characteristics(&self.characteristic_ids)
            .await?;
        self.io.replace_endpoints(characteristics);
        self.exchange.attach();
        self.io.start_notifications().await?;
        self.setup().await?;

        tokio::time::sleep(self.config.settle_delay()).await;
        Ok(())
    }

    /// Rejects any pending gate wait and forgets the negotiated frame size.
    pub fn disconnect(&self) {
        self.gate.reject(DeviceExchangeError::ReconnectionFailed);
        self.negotiator.reset();
    }

    /// Returns whether an MTU has been negotiated on the current link.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.negotiator.ready_state()
    }
}

#[async_trait]
impl DeviceApduSender for BleDeviceConnection {
    type Dependencies = CharacteristicPair;

    async fn send_apdu(
        &self,
        apdu: &[u8],
        triggers_disconnection: bool,
        abort_timeout: Option<Duration>,
    ) -> Result<ApduResponse, DeviceExchangeError> {
        BleDeviceConnection::send_apdu(self, apdu, triggers_disconnection, abort_timeout).await
    }

    fn dependencies(&self) -> CharacteristicPair {
        self.io.endpoints()
    }

    fn set_dependencies(&self, dependencies: CharacteristicPair) {
        self.negotiator.reset();
        self.exchange
            .fail_pending(DeviceExchangeError::DeviceDisconnectedWhileSending);
        self.exchange.reset_receiver();
        self.io.replace_endpoints(dependencies);
    }

    async fn setup_connection(&self) -> Result<(), DeviceExchangeError> {
        self.setup().await
    }

    #[instrument(skip(self), level = "debug")]
    async fn close_connection(&self) {
        self.exchange
            .fail_pending(DeviceExchangeError::DeviceDisconnectedWhileSending);
        self.disconnect();
        if let Err(error) = self.io.stop_notifications().await {
            debug!(%error, "failed to stop notifications while closing");
        }
        if let Err(error) = self.link.disconnect().await {
            warn!(%error, "failed to disconnect link while closing");
        }
    }
}
