use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bon::bon;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, trace, warn};

use super::model::FoundDevice;
use crate::apdu::{
    ApduResponse, DisconnectionHeuristic, GET_APP_AND_VERSION, KnownDisconnectingCommands,
};
use crate::ble::{
    BleLink, CharacteristicPair, LinkEvent, LinkEventStream, NotificationStream, NotifyEndpoint,
    WriteEndpoint,
};
use crate::error::{FixtureError, LinkError};
use crate::framing::{FrameReassembler, encode_frames};
use crate::protocol::{CharacteristicIds, DeviceFamily, MTU_REQUEST};
use crate::utils::format_hex;

pub(crate) const DEFAULT_FAKE_DEVICE_NAME: &str = "Ledger Nano X FAKE";
pub(crate) const DEFAULT_FAKE_MTU: u8 = 0x99;
const FAKE_APP_NAME: &str = "BOLOS";
const FAKE_APP_VERSION: &str = "2.2.3";
const RESTART_DROP_DELAY: Duration = Duration::from_millis(10);
const CHANNEL_CAPACITY: usize = 64;

/// Parsed fake device response: response data followed by the status word.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Into)]
pub struct FakeResponse {
    raw: Vec<u8>,
}

impl FromStr for FakeResponse {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = parse_hex(value)?;
        if raw.len() < 2 {
            return Err(FixtureError::ResponseTooShort);
        }
        Ok(Self { raw })
    }
}

/// Parses hexadecimal bytes, ignoring whitespace.
pub(crate) fn parse_hex(value: &str) -> Result<Vec<u8>, FixtureError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).map_err(|source| FixtureError::InvalidHex {
        value: value.to_string(),
        source,
    })
}

/// In-memory hardware wallet speaking the BLE APDU protocol.
///
/// Answers the MTU request, reassembles framed APDUs and answers them with
/// scripted responses (or `90 00`, or a get-app-and-version payload). Test
/// hooks inject link drops and endpoint failures.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    inner: Arc<FakeDeviceInner>,
}

#[derive(Debug)]
struct FakeDeviceInner {
    name: String,
    mtu: u8,
    silent: bool,
    ignore_mtu_requests: bool,
    restart_delay: Option<Duration>,
    characteristic_ids: CharacteristicIds,
    notifications: broadcast::Sender<Vec<u8>>,
    link_events: broadcast::Sender<LinkEvent>,
    state: Mutex<FakeDeviceState>,
}

#[derive(Debug, Default)]
struct FakeDeviceState {
    connected: bool,
    restarting: bool,
    responses: VecDeque<Vec<u8>>,
    zero_mtu_replies: usize,
    failing_writes: usize,
    failing_start_notifications: usize,
    start_notification_attempts: usize,
    connect_calls: usize,
    disconnect_calls: usize,
    written_frames: Vec<Vec<u8>>,
    received_apdus: Vec<Vec<u8>>,
    reassembler: FrameReassembler,
}

#[bon]
impl FakeDevice {
    /// Creates a connected fake device.
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_FAKE_DEVICE_NAME)] name: String,
        #[builder(default = DEFAULT_FAKE_MTU)] mtu: u8,
        /// Raw responses returned in order, before falling back to defaults.
        #[builder(default)]
        responses: Vec<Vec<u8>>,
        /// Never answers APDUs (MTU requests are still answered).
        #[builder(default)]
        silent: bool,
        #[builder(default)] ignore_mtu_requests: bool,
        /// Number of zero-sized MTU replies sent before the real one.
        #[builder(default)]
        zero_mtu_replies_first: usize,
        /// When set, open-app and quit-app commands make the device drop the
        /// link and refuse connections for this long.
        restart_delay: Option<Duration>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (link_events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let characteristic_ids =
            CharacteristicIds::for_profile(&DeviceFamily::NanoX.gatt_profile(), true);

        Self {
            inner: Arc::new(FakeDeviceInner {
                name,
                mtu,
                silent,
                ignore_mtu_requests,
                restart_delay,
                characteristic_ids,
                notifications,
                link_events,
                state: Mutex::new(FakeDeviceState {
                    connected: true,
                    responses: responses.into(),
                    zero_mtu_replies: zero_mtu_replies_first,
                    ..FakeDeviceState::default()
                }),
            }),
        }
    }
}

impl FakeDevice {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn characteristic_ids(&self) -> CharacteristicIds {
        self.inner.characteristic_ids
    }

    /// Returns the device as seen by a scan.
    #[must_use]
    pub fn found_device(&self) -> FoundDevice {
        FoundDevice::new(
            "fake0".to_string(),
            "fake:00:00:00:00:00:01".to_string(),
            Some(self.inner.name.clone()),
            Some(-42),
        )
        .with_family(DeviceFamily::NanoX)
    }

    #[must_use]
    pub fn link(&self) -> Arc<dyn BleLink> {
        Arc::new(FakeLink {
            device: self.clone(),
        })
    }

    /// Returns fresh write and notify endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotConnected`] while the link is down.
    pub fn characteristics(&self) -> Result<CharacteristicPair, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        Ok(CharacteristicPair {
            write: Arc::new(FakeWriteEndpoint {
                device: self.clone(),
            }),
            notify: Arc::new(FakeNotifyEndpoint {
                device: self.clone(),
            }),
        })
    }

    /// Pushes a raw notification to every open value stream.
    pub fn notify(&self, value: &[u8]) {
        if self.inner.notifications.send(value.to_vec()).is_err() {
            trace!("no notification subscribers");
        }
    }

    /// Drops the link as if the device went out of range.
    pub fn drop_link(&self) {
        let was_connected = std::mem::replace(&mut self.inner.state.lock().connected, false);
        if was_connected {
            info!(name = %self.inner.name, "fake device dropped the link");
            let _ = self.inner.link_events.send(LinkEvent::Disconnected);
        }
    }

    /// Makes the device refuse (`true`) or accept (`false`) connections.
    pub fn set_restarting(&self, restarting: bool) {
        self.inner.state.lock().restarting = restarting;
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.inner.state.lock().failing_writes = count;
    }

    pub fn fail_next_start_notifications(&self, count: usize) {
        self.inner.state.lock().failing_start_notifications = count;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    /// Returns every successfully written frame, MTU requests included.
    #[must_use]
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().written_frames.clone()
    }

    /// Returns every APDU the device fully reassembled.
    #[must_use]
    pub fn received_apdus(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().received_apdus.clone()
    }

    #[must_use]
    pub fn start_notification_attempts(&self) -> usize {
        self.inner.state.lock().start_notification_attempts
    }

    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.inner.state.lock().connect_calls
    }

    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.inner.state.lock().disconnect_calls
    }

    fn handle_write(&self, value: &[u8]) -> Result<(), LinkError> {
        let mut replies = Vec::new();
        let mut restart = false;
        {
            let mut state = self.inner.state.lock();
            if !state.connected {
                return Err(LinkError::NotConnected);
            }
            if state.failing_writes > 0 {
                state.failing_writes -= 1;
                return Err(LinkError::Injected {
                    reason: "write rejected".to_string(),
                });
            }
            state.written_frames.push(value.to_vec());

            if value == MTU_REQUEST {
                if self.inner.ignore_mtu_requests {
                    trace!("ignoring MTU request");
                    return Ok(());
                }
                for _ in 0..std::mem::take(&mut state.zero_mtu_replies) {
                    replies.push(mtu_reply(0));
                }
                replies.push(mtu_reply(self.inner.mtu));
            } else {
                match state.reassembler.push(value) {
                    Ok(None) => {}
                    Ok(Some(apdu)) => {
                        debug!(apdu = %format_hex(&apdu), "fake device received APDU");
                        state.received_apdus.push(apdu.clone());
                        if !self.inner.silent {
                            let response = state
                                .responses
                                .pop_front()
                                .unwrap_or_else(|| default_response(&apdu));
                            match encode_frames(&response, usize::from(self.inner.mtu)) {
                                Ok(frames) => replies.extend(frames.into_iter().map(Vec::from)),
                                Err(error) => warn!(%error, "fake device cannot frame response"),
                            }
                            restart = self.inner.restart_delay.is_some()
                                && ApduResponse::from_raw(&response)
                                    .is_some_and(|response| response.is_success())
                                && KnownDisconnectingCommands.triggers_disconnection(&apdu);
                        }
                    }
                    Err(error) => {
                        debug!(%error, "fake device rejected frame");
                        state.reassembler.reset();
                    }
                }
            }
        }

        for reply in replies {
            self.notify(&reply);
        }
        if restart {
            self.schedule_restart();
        }
        Ok(())
    }

    fn schedule_restart(&self) {
        let Some(restart_delay) = self.inner.restart_delay else {
            return;
        };
        let device = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DROP_DELAY).await;
            device.set_restarting(true);
            device.drop_link();
            tokio::time::sleep(restart_delay).await;
            device.set_restarting(false);
            debug!("fake device finished restarting");
        });
    }
}

fn mtu_reply(size: u8) -> Vec<u8> {
    let mut reply = MTU_REQUEST.to_vec();
    reply.push(size);
    reply
}

fn default_response(apdu: &[u8]) -> Vec<u8> {
    if apdu != GET_APP_AND_VERSION {
        return ApduResponse::success().to_raw();
    }

    let mut data = vec![0x01];
    for field in [FAKE_APP_NAME, FAKE_APP_VERSION] {
        data.push(u8::try_from(field.len()).unwrap_or(u8::MAX));
        data.extend_from_slice(field.as_bytes());
    }
    data.extend_from_slice(&[0x01, 0x00]);
    ApduResponse::new([0x90, 0x00], data).to_raw()
}

#[derive(Debug)]
struct FakeLink {
    device: FakeDevice,
}

#[async_trait]
impl BleLink for FakeLink {
    async fn is_connected(&self) -> Result<bool, LinkError> {
        Ok(self.device.is_connected())
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let newly_connected = {
            let mut state = self.device.inner.state.lock();
            state.connect_calls += 1;
            if state.restarting {
                return Err(LinkError::Injected {
                    reason: "device is restarting".to_string(),
                });
            }
            !std::mem::replace(&mut state.connected, true)
        };
        if newly_connected {
            let _ = self.device.inner.link_events.send(LinkEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let was_connected = {
            let mut state = self.device.inner.state.lock();
            state.disconnect_calls += 1;
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            let _ = self.device.inner.link_events.send(LinkEvent::Disconnected);
        }
        Ok(())
    }

    async fn acquire_characteristics(
        &self,
        ids: &CharacteristicIds,
    ) -> Result<CharacteristicPair, LinkError> {
        let expected = self.device.characteristic_ids();
        if ids.service != expected.service {
            return Err(LinkError::MissingService {
                uuid: ids.service.to_string(),
            });
        }
        if ids.write != expected.write {
            return Err(LinkError::MissingCharacteristic {
                uuid: ids.write.to_string(),
            });
        }
        self.device.characteristics()
    }

    async fn events(&self) -> Result<LinkEventStream, LinkError> {
        let events = BroadcastStream::new(self.device.inner.link_events.subscribe())
            .filter_map(Result::ok);
        Ok(Box::pin(events))
    }
}

#[derive(Debug)]
struct FakeWriteEndpoint {
    device: FakeDevice,
}

#[async_trait]
impl WriteEndpoint for FakeWriteEndpoint {
    async fn write_value(&self, value: &[u8]) -> Result<(), LinkError> {
        self.device.handle_write(value)
    }
}

#[derive(Debug)]
struct FakeNotifyEndpoint {
    device: FakeDevice,
}

#[async_trait]
impl NotifyEndpoint for FakeNotifyEndpoint {
    async fn start_notifications(&self) -> Result<(), LinkError> {
        let mut state = self.device.inner.state.lock();
        state.start_notification_attempts += 1;
        if state.failing_start_notifications > 0 {
            state.failing_start_notifications -= 1;
            return Err(LinkError::Injected {
                reason: "start notifications rejected".to_string(),
            });
        }
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    async fn stop_notifications(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn value_stream(&self) -> Result<NotificationStream, LinkError> {
        let values = BroadcastStream::new(self.device.inner.notifications.subscribe())
            .filter_map(Result::ok);
        Ok(Box::pin(values))
    }
}
