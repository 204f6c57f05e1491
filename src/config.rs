use std::time::Duration;

use bon::Builder;

pub const DEFAULT_RECONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing knobs shared by the connection state machine and the BLE adapter.
///
/// ```
/// use std::time::Duration;
///
/// let config = hwlink::ConnectionConfig::builder()
///     .reconnection_timeout(Duration::from_secs(10))
///     .build();
/// assert_eq!(Duration::from_secs(10), config.reconnection_timeout());
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder)]
pub struct ConnectionConfig {
    /// How long the state machine waits for the device to come back.
    #[builder(default = DEFAULT_RECONNECTION_TIMEOUT)]
    reconnection_timeout: Duration,
    /// Pause after a BLE reconnect before the link is used again.
    #[builder(default = DEFAULT_SETTLE_DELAY)]
    settle_delay: Duration,
    /// Base delay between exchange retries, multiplied by the attempt number.
    #[builder(default = DEFAULT_RETRY_BACKOFF)]
    retry_backoff: Duration,
    /// Upper bound on the MTU handshake.
    #[builder(default = DEFAULT_NEGOTIATION_TIMEOUT)]
    negotiation_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn reconnection_timeout(&self) -> Duration {
        self.reconnection_timeout
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    #[must_use]
    pub fn negotiation_timeout(&self) -> Duration {
        self.negotiation_timeout
    }
}
