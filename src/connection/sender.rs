use std::time::Duration;

use async_trait::async_trait;

use crate::apdu::ApduResponse;
use crate::error::DeviceExchangeError;

/// Transport adapter driven by [`ConnectionStateMachine`](super::ConnectionStateMachine).
///
/// Implementations perform one APDU exchange per `send_apdu` call. They never
/// see two overlapping calls from the state machine.
#[async_trait]
pub trait DeviceApduSender: Send + Sync + 'static {
    /// Transport handles the adapter exchanges over, swappable after a reconnect.
    type Dependencies: Send;

    /// Sends one APDU and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns the exchange failure; the state machine forwards it unchanged.
    async fn send_apdu(
        &self,
        apdu: &[u8],
        triggers_disconnection: bool,
        abort_timeout: Option<Duration>,
    ) -> Result<ApduResponse, DeviceExchangeError>;

    fn dependencies(&self) -> Self::Dependencies;

    fn set_dependencies(&self, dependencies: Self::Dependencies);

    /// Prepares the transport for exchanges.
    ///
    /// # Errors
    ///
    /// Returns the setup failure reported by the transport.
    async fn setup_connection(&self) -> Result<(), DeviceExchangeError>;

    /// Releases the transport. Failures are logged by the implementation.
    async fn close_connection(&self);
}
