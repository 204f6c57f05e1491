use std::time::Duration;

use thiserror::Error;

use crate::framing::FramingError;

/// Errors settled into an APDU exchange continuation.
///
/// Every failure of `send_apdu` surfaces through one of these variants; the
/// connection layer never reports errors any other way.
#[derive(Debug, Error)]
pub enum DeviceExchangeError {
    #[error("another APDU is already being sent on this connection")]
    AlreadySendingApdu,
    #[error("the device disconnected while the APDU exchange was in progress")]
    DeviceDisconnectedWhileSending,
    #[error("the device did not reconnect before the queued APDU could be sent")]
    DeviceDisconnectedBeforeSendingApdu,
    #[error("the device connection is not initialised: {reason}")]
    DeviceNotInitialized { reason: String },
    #[error("reconnecting to the device failed")]
    ReconnectionFailed,
    #[error("no APDU response was received within {}", humantime::format_duration(*timeout))]
    SendApduTimeout { timeout: Duration },
    #[error("device exchange failed: {reason}")]
    UnknownDeviceExchange { reason: String },
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl DeviceExchangeError {
    pub(crate) fn not_initialized(reason: impl Into<String>) -> Self {
        Self::DeviceNotInitialized {
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown(reason: impl Into<String>) -> Self {
        Self::UnknownDeviceExchange {
            reason: reason.into(),
        }
    }
}

/// Errors returned by BLE link and characteristic operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("the BLE link is not connected")]
    NotConnected,
    #[error("service `{uuid}` was not found on the connected device")]
    MissingService { uuid: String },
    #[error("characteristic `{uuid}` was not found on the connected device")]
    MissingCharacteristic { uuid: String },
    #[error("no known hardware-wallet GATT profile matched the discovered services")]
    UnknownGattProfile,
    #[error("failed to listen for Ctrl-C")]
    CtrlC { source: std::io::Error },
    #[error("scan interrupted before a matching device was found")]
    ScanInterrupted,
    #[error("no device matching `{prefix}*` was found in the fake backend")]
    NoMatchingFixtureDevice { prefix: String },
    #[error("injected fake link failure: {reason}")]
    Injected { reason: String },
}

/// Errors returned when parsing fake backend fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("invalid hex payload `{value}`")]
    InvalidHex {
        value: String,
        source: hex::FromHexError,
    },
    #[error("fake responses must contain at least the two status bytes")]
    ResponseTooShort,
    #[error("fake MTU must be larger than the first frame header")]
    MtuTooSmall,
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("--reconnection-timeout must be greater than zero")]
    ZeroReconnectionTimeout,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
