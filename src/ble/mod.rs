mod characteristic;
mod device_connection;
mod exchange;
mod gate;
mod mtu;

pub use self::characteristic::{
    BleLink, CharacteristicIo, CharacteristicPair, LinkEvent, LinkEventStream, NotificationStream,
    NotifyEndpoint, ValueHandler, WriteEndpoint,
};
pub use self::device_connection::{BleDeviceConnection, BleDeviceConnectionParams};
pub use self::exchange::ApduExchange;
pub use self::gate::ReconnectionGate;
pub use self::mtu::MtuNegotiator;
