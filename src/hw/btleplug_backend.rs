use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace};

use super::hardware::ConnectedDevice;
use super::model::{CharacteristicInfo, FoundDevice, ServiceInfo};
use super::session::negotiate_endpoints;
use crate::ble::{
    BleLink, CharacteristicPair, LinkEvent, LinkEventStream, NotificationStream, NotifyEndpoint,
    WriteEndpoint,
};
use crate::error::LinkError;
use crate::protocol::CharacteristicIds;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Hardware backend backed by `btleplug`.
#[derive(Debug)]
pub(crate) struct BtleplugBackend {
    manager: Manager,
}

impl BtleplugBackend {
    pub(crate) async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new().await?;
        Ok(Self { manager })
    }

    /// Scans indefinitely until the first matching peripheral appears, then connects.
    #[instrument(skip(self), level = "debug", fields(prefix = name_prefix))]
    async fn find_and_connect_first_matching(
        &self,
        name_prefix: &str,
    ) -> Result<ConnectedPeripheral, LinkError> {
        let adapters = self.adapters().await?;
        info!(
            adapter_count = adapters.len(),
            "starting indefinite BLE scan"
        );

        for adapter in &adapters {
            adapter.adapter.start_scan(ScanFilter::default()).await?;
        }

        loop {
            for adapter in &adapters {
                let peripherals = adapter.adapter.peripherals().await?;
                for peripheral in peripherals {
                    let Some(properties) = peripheral.properties().await? else {
                        continue;
                    };
                    let rssi = properties.rssi;
                    let local_name = properties.local_name;
                    if !matches_name_prefix(local_name.as_deref(), name_prefix) {
                        continue;
                    }

                    for handle in &adapters {
                        if let Err(error) = handle.adapter.stop_scan().await {
                            debug!(?error, "failed to stop adapter scan cleanly");
                        }
                    }

                    if !peripheral.is_connected().await? {
                        peripheral.connect().await?;
                    }
                    peripheral.discover_services().await?;

                    let device = FoundDevice::new(
                        adapter.name.clone(),
                        peripheral.id().to_string(),
                        local_name,
                        rssi,
                    );
                    info!(device_id = device.device_id(), "connected to matching peripheral");
                    return Ok(ConnectedPeripheral {
                        adapter: adapter.adapter.clone(),
                        peripheral,
                        device,
                    });
                }
            }

            tokio::select! {
                () = sleep(SCAN_POLL_INTERVAL) => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.map_err(|source| LinkError::CtrlC { source })?;
                    for handle in &adapters {
                        if let Err(error) = handle.adapter.stop_scan().await {
                            debug!(?error, "failed to stop adapter scan after interrupt");
                        }
                    }
                    return Err(LinkError::ScanInterrupted);
                }
            }
        }
    }

    #[instrument(skip(self), level = "trace")]
    async fn adapters(&self) -> Result<Vec<AdapterHandle>, LinkError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(LinkError::NoAdapters);
        }

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.adapter_info().await?;
            handles.push(AdapterHandle { adapter, name });
        }
        Ok(handles)
    }

    /// Connects to the first matching peripheral and resolves its APDU endpoints.
    #[instrument(skip(self), level = "debug", fields(prefix = name_prefix))]
    pub(crate) async fn connect_first_matching_device(
        self,
        name_prefix: &str,
    ) -> Result<ConnectedDevice, LinkError> {
        let connected = self.find_and_connect_first_matching(name_prefix).await?;
        let services = collect_services(&connected.peripheral);
        let endpoints = match negotiate_endpoints(&services) {
            Ok(endpoints) => endpoints,
            Err(error) => {
                if let Err(disconnect_error) = connected.peripheral.disconnect().await {
                    debug!(
                        ?disconnect_error,
                        "failed to disconnect after endpoint negotiation error"
                    );
                }
                return Err(error);
            }
        };

        let link = BtleplugLink {
            adapter: connected.adapter,
            peripheral: connected.peripheral,
        };
        let characteristics = link
            .acquire_characteristics(&endpoints.characteristic_ids)
            .await?;

        Ok(ConnectedDevice {
            device: connected.device.with_family(endpoints.family),
            link: Arc::new(link),
            characteristics,
            characteristic_ids: endpoints.characteristic_ids,
        })
    }
}

fn matches_name_prefix(local_name: Option<&str>, name_prefix: &str) -> bool {
    if name_prefix.is_empty() {
        return true;
    }

    local_name.is_some_and(|value| value.starts_with(name_prefix))
}

fn write_type_for(properties: CharPropFlags) -> WriteType {
    if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

/// Physical link to a `btleplug` peripheral.
#[derive(Debug)]
struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn characteristic(
        &self,
        ids: &CharacteristicIds,
        uuid: uuid::Uuid,
    ) -> Result<Characteristic, LinkError> {
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|service| service.uuid == ids.service)
            .ok_or_else(|| LinkError::MissingService {
                uuid: ids.service.to_string(),
            })?;
        service
            .characteristics
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or_else(|| LinkError::MissingCharacteristic {
                uuid: uuid.to_string(),
            })
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn is_connected(&self) -> Result<bool, LinkError> {
        Ok(self.peripheral.is_connected().await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn connect(&self) -> Result<(), LinkError> {
        self.peripheral.connect().await?;
        self.peripheral.discover_services().await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self) -> Result<(), LinkError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(service = %ids.service))]
    async fn acquire_characteristics(
        &self,
        ids: &CharacteristicIds,
    ) -> Result<CharacteristicPair, LinkError> {
        let write = self.characteristic(ids, ids.write)?;
        let notify = self.characteristic(ids, ids.notify)?;
        let write_type = write_type_for(write.properties);
        trace!(?write_type, "resolved APDU characteristics");

        Ok(CharacteristicPair {
            write: Arc::new(BtleplugWriteEndpoint {
                peripheral: self.peripheral.clone(),
                characteristic: write,
                write_type,
            }),
            notify: Arc::new(BtleplugNotifyEndpoint {
                peripheral: self.peripheral.clone(),
                characteristic: notify,
            }),
        })
    }

    async fn events(&self) -> Result<LinkEventStream, LinkError> {
        let peripheral_id = self.peripheral.id();
        let events = self
            .adapter
            .events()
            .await?
            .filter_map(move |event| match event {
                CentralEvent::DeviceConnected(id) if id == peripheral_id => {
                    Some(LinkEvent::Connected)
                }
                CentralEvent::DeviceDisconnected(id) if id == peripheral_id => {
                    Some(LinkEvent::Disconnected)
                }
                _ => None,
            });
        Ok(Box::pin(events))
    }
}

#[derive(Debug)]
struct BtleplugWriteEndpoint {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
}

#[async_trait]
impl WriteEndpoint for BtleplugWriteEndpoint {
    #[instrument(skip(self, value), level = "trace", fields(value_len = value.len()))]
    async fn write_value(&self, value: &[u8]) -> Result<(), LinkError> {
        self.peripheral
            .write(&self.characteristic, value, self.write_type)
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
struct BtleplugNotifyEndpoint {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

#[async_trait]
impl NotifyEndpoint for BtleplugNotifyEndpoint {
    async fn start_notifications(&self) -> Result<(), LinkError> {
        self.peripheral.subscribe(&self.characteristic).await?;
        Ok(())
    }

    async fn stop_notifications(&self) -> Result<(), LinkError> {
        self.peripheral.unsubscribe(&self.characteristic).await?;
        Ok(())
    }

    async fn value_stream(&self) -> Result<NotificationStream, LinkError> {
        let expected = self.characteristic.uuid;
        let values = self
            .peripheral
            .notifications()
            .await?
            .filter_map(move |notification| {
                (notification.uuid == expected).then_some(notification.value)
            });
        Ok(Box::pin(values))
    }
}

#[derive(Debug)]
struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

#[derive(Debug)]
struct ConnectedPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    device: FoundDevice,
}

fn collect_services(peripheral: &Peripheral) -> Vec<ServiceInfo> {
    let mut services: Vec<ServiceInfo> = peripheral
        .services()
        .into_iter()
        .map(|service| {
            let mut characteristics: Vec<CharacteristicInfo> = service
                .characteristics
                .iter()
                .map(|characteristic| {
                    CharacteristicInfo::new(
                        characteristic.uuid.to_string().to_lowercase(),
                        property_labels(characteristic.properties),
                    )
                })
                .collect();
            characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));
            ServiceInfo::new(service.uuid.to_string().to_lowercase(), characteristics)
        })
        .collect();
    services.sort_by(|left, right| left.uuid().cmp(right.uuid()));
    services
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some("Nano X 1A2B"), "Nano", true)]
    #[case(Some("Stax 0F"), "Nano", false)]
    #[case(None, "Nano", false)]
    #[case(None, "", true)]
    fn name_prefix_matching(
        #[case] local_name: Option<&str>,
        #[case] prefix: &str,
        #[case] expected: bool,
    ) {
        assert_eq!(expected, matches_name_prefix(local_name, prefix));
    }

    #[test]
    fn write_without_response_is_preferred_when_supported() {
        let flags = CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE;

        assert_eq!(WriteType::WithoutResponse, write_type_for(flags));
        assert_eq!(WriteType::WithResponse, write_type_for(CharPropFlags::WRITE));
    }

    #[test]
    fn property_labels_match_negotiation_names() {
        let labels = property_labels(CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE);

        assert_eq!(
            vec!["write_without_response".to_string(), "notify".to_string()],
            labels
        );
        assert_eq!(vec!["none".to_string()], property_labels(CharPropFlags::empty()));
    }
}
