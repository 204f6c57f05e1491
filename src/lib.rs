mod apdu;
mod app;
mod ble;
mod cli;
mod config;
mod connection;
mod error;
mod framing;
mod hw;
mod protocol;
mod telemetry;
mod utils;

pub use apdu::{
    ApduResponse, AppAndVersion, AppVersionDecodeError, DisconnectionHeuristic,
    GET_APP_AND_VERSION, KnownDisconnectingCommands, NeverDisconnects, SUCCESS_STATUS_WORD,
};
pub use app::{
    SessionHandler, fake_device_client, fake_hardware_client, real_hardware_client, run,
    run_with_log_level,
};
pub use ble::{
    ApduExchange, BleDeviceConnection, BleDeviceConnectionParams, BleLink, CharacteristicIo,
    CharacteristicPair, LinkEvent, LinkEventStream, MtuNegotiator, NotificationStream,
    NotifyEndpoint, ReconnectionGate, ValueHandler, WriteEndpoint,
};
pub use cli::{Args, Command, FakeArgs, LogLevel, OutputFormat, RunSettings, SendArgs};
pub use config::{
    ConnectionConfig, DEFAULT_NEGOTIATION_TIMEOUT, DEFAULT_RECONNECTION_TIMEOUT,
    DEFAULT_RETRY_BACKOFF, DEFAULT_SETTLE_DELAY,
};
pub use connection::{
    ConnectionStateKind, ConnectionStateMachine, ConnectionStateMachineParams, DeviceApduSender,
    PendingResponse, ReconnectionHook, TerminationHook,
};
pub use error::{DeviceExchangeError, FixtureError, LinkError};
pub use framing::{
    Frame, FrameReceiver, FrameReceiverFactory, FrameSender, FrameSenderFactory, FrameSize,
    Framing, FramingError, LedgerBleFrameReceiver, LedgerBleFrameSender,
};
pub use hw::{
    CharacteristicInfo, DeviceSession, FakeDevice, FakeResponse, FoundDevice, HardwareClient,
    ServiceInfo,
};
pub use protocol::{CharacteristicIds, DeviceFamily, GattProfile};
