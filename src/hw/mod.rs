mod btleplug_backend;
mod fake_backend;
mod hardware;
mod model;
mod session;
mod supervisor;

pub use self::fake_backend::{FakeDevice, FakeResponse};
pub(crate) use self::fake_backend::{DEFAULT_FAKE_DEVICE_NAME, DEFAULT_FAKE_MTU, parse_hex};
pub use self::hardware::{DeviceSession, HardwareClient};
pub(crate) use self::hardware::{fake_hardware_client, real_hardware_client};
pub use self::model::{CharacteristicInfo, FoundDevice, ServiceInfo};
