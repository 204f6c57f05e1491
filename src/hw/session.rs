use tracing::{debug, instrument};

use super::model::{CharacteristicInfo, ServiceInfo};
use crate::error::LinkError;
use crate::protocol::{CharacteristicIds, DeviceFamily, GattProfile, known_profiles};

/// Endpoints chosen for APDU exchanges on a connected device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct NegotiatedEndpoints {
    pub(crate) family: DeviceFamily,
    pub(crate) characteristic_ids: CharacteristicIds,
}

/// Matches discovered services against the known device families.
///
/// The write-without-response characteristic is preferred when the device
/// exposes it with the matching property.
#[instrument(skip(services), level = "debug", fields(service_count = services.len()))]
pub(crate) fn negotiate_endpoints(services: &[ServiceInfo]) -> Result<NegotiatedEndpoints, LinkError> {
    for profile in known_profiles() {
        let Some(service) = find_service(services, &profile) else {
            continue;
        };
        let Some(notify) = find_characteristic(service, &profile.notify().to_string()) else {
            continue;
        };
        if !notify.has_property("notify") {
            continue;
        }

        let write_cmd = find_characteristic(service, &profile.write_cmd().to_string())
            .filter(|characteristic| characteristic.has_property("write_without_response"));
        let write = find_characteristic(service, &profile.write().to_string())
            .filter(|characteristic| supports_write(characteristic));
        let prefer_write_cmd = match (write_cmd, write) {
            (Some(_), _) => true,
            (None, Some(_)) => false,
            (None, None) => continue,
        };

        debug!(family = %profile.family(), prefer_write_cmd, "matched GATT profile");
        return Ok(NegotiatedEndpoints {
            family: profile.family(),
            characteristic_ids: CharacteristicIds::for_profile(&profile, prefer_write_cmd),
        });
    }

    Err(LinkError::UnknownGattProfile)
}

fn find_service<'a>(services: &'a [ServiceInfo], profile: &GattProfile) -> Option<&'a ServiceInfo> {
    let uuid = profile.service().to_string();
    services
        .iter()
        .find(|service| service.uuid().eq_ignore_ascii_case(&uuid))
}

fn find_characteristic<'a>(service: &'a ServiceInfo, uuid: &str) -> Option<&'a CharacteristicInfo> {
    service
        .characteristics()
        .iter()
        .find(|characteristic| characteristic.uuid().eq_ignore_ascii_case(uuid))
}

fn supports_write(characteristic: &CharacteristicInfo) -> bool {
    characteristic.has_property("write") || characteristic.has_property("write_without_response")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn characteristic(uuid: uuid::Uuid, properties: &[&str]) -> CharacteristicInfo {
        CharacteristicInfo::new(
            uuid.to_string(),
            properties.iter().map(ToString::to_string).collect(),
        )
    }

    fn service(profile: &GattProfile, with_write_cmd: bool) -> ServiceInfo {
        let mut characteristics = vec![
            characteristic(profile.notify(), &["notify"]),
            characteristic(profile.write(), &["write"]),
        ];
        if with_write_cmd {
            characteristics.push(characteristic(profile.write_cmd(), &["write_without_response"]));
        }
        ServiceInfo::new(profile.service().to_string().to_uppercase(), characteristics)
    }

    #[rstest]
    #[case(DeviceFamily::NanoX)]
    #[case(DeviceFamily::Stax)]
    #[case(DeviceFamily::Flex)]
    fn resolves_each_family_and_prefers_write_cmd(#[case] family: DeviceFamily) {
        let profile = family.gatt_profile();

        let endpoints = negotiate_endpoints(&[service(&profile, true)])
            .expect("known service should resolve");

        assert_eq!(family, endpoints.family);
        assert_eq!(profile.write_cmd(), endpoints.characteristic_ids.write);
        assert_eq!(profile.notify(), endpoints.characteristic_ids.notify);
    }

    #[test]
    fn falls_back_to_write_with_response() {
        let profile = DeviceFamily::Stax.gatt_profile();

        let endpoints = negotiate_endpoints(&[service(&profile, false)])
            .expect("service without write cmd should still resolve");

        assert_eq!(profile.write(), endpoints.characteristic_ids.write);
    }

    #[test]
    fn rejects_notify_characteristic_without_notify_property() {
        let profile = DeviceFamily::Flex.gatt_profile();
        let service = ServiceInfo::new(
            profile.service().to_string(),
            vec![
                characteristic(profile.notify(), &["read"]),
                characteristic(profile.write(), &["write"]),
            ],
        );

        assert_matches!(
            negotiate_endpoints(&[service]),
            Err(LinkError::UnknownGattProfile)
        );
    }

    #[test]
    fn unknown_services_are_rejected() {
        let service = ServiceInfo::new(
            "0000180f-0000-1000-8000-00805f9b34fb".to_string(),
            Vec::new(),
        );

        assert_matches!(
            negotiate_endpoints(&[service]),
            Err(LinkError::UnknownGattProfile)
        );
    }
}
