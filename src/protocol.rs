use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use uuid::Uuid;

/// Control frame asking the device to report its frame size.
pub(crate) const MTU_REQUEST: [u8; 5] = [0x08, 0x00, 0x00, 0x00, 0x00];

/// Byte offset of the frame size inside the MTU reply.
pub(crate) const MTU_REPLY_SIZE_OFFSET: usize = 5;

/// Hardware-wallet families that expose the APDU GATT service.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    #[strum(to_string = "nano_x")]
    NanoX,
    #[strum(to_string = "stax")]
    Stax,
    #[strum(to_string = "flex")]
    Flex,
}

impl DeviceFamily {
    /// Returns the GATT layout used by this family.
    #[must_use]
    pub fn gatt_profile(self) -> GattProfile {
        match self {
            Self::NanoX => GattProfile::from_service_prefix(self, 0x13d6_3400_2c97_0004),
            Self::Stax => GattProfile::from_service_prefix(self, 0x13d6_3400_2c97_6004),
            Self::Flex => GattProfile::from_service_prefix(self, 0x13d6_3400_2c97_3004),
        }
    }
}

/// Service and characteristic UUIDs of one device family.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GattProfile {
    family: DeviceFamily,
    service: Uuid,
    notify: Uuid,
    write: Uuid,
    write_cmd: Uuid,
}

impl GattProfile {
    const fn from_service_prefix(family: DeviceFamily, prefix: u64) -> Self {
        Self {
            family,
            service: ledger_uuid(prefix, 0x0000),
            notify: ledger_uuid(prefix, 0x0001),
            write: ledger_uuid(prefix, 0x0002),
            write_cmd: ledger_uuid(prefix, 0x0003),
        }
    }

    #[must_use]
    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    #[must_use]
    pub fn service(&self) -> Uuid {
        self.service
    }

    #[must_use]
    pub fn notify(&self) -> Uuid {
        self.notify
    }

    #[must_use]
    pub fn write(&self) -> Uuid {
        self.write
    }

    /// Write-without-response characteristic.
    #[must_use]
    pub fn write_cmd(&self) -> Uuid {
        self.write_cmd
    }
}

// Characteristics share the service UUID and differ in the fourth group.
const fn ledger_uuid(prefix: u64, group: u64) -> Uuid {
    const SUFFIX: u64 = 0x4c65_6467_6572;
    Uuid::from_u64_pair(prefix, (group << 48) | SUFFIX)
}

/// Returns the GATT layouts of every known family.
pub(crate) fn known_profiles() -> impl Iterator<Item = GattProfile> {
    DeviceFamily::iter().map(DeviceFamily::gatt_profile)
}

/// Identifiers the BLE connection uses to re-acquire its endpoints after a reconnect.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CharacteristicIds {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl CharacteristicIds {
    /// Picks the write-without-response characteristic when `prefer_write_cmd` is set.
    #[must_use]
    pub fn for_profile(profile: &GattProfile, prefer_write_cmd: bool) -> Self {
        Self {
            service: profile.service(),
            write: if prefer_write_cmd {
                profile.write_cmd()
            } else {
                profile.write()
            },
            notify: profile.notify(),
        }
    }
}
