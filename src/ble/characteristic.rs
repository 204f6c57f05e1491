use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::error::LinkError;
use crate::protocol::CharacteristicIds;

/// Values pushed by a notify characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Physical link state changes reported by the platform.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

pub type LinkEventStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// Write-only GATT characteristic.
#[async_trait]
pub trait WriteEndpoint: fmt::Debug + Send + Sync {
    async fn write_value(&self, value: &[u8]) -> Result<(), LinkError>;
}

/// Notify GATT characteristic.
#[async_trait]
pub trait NotifyEndpoint: fmt::Debug + Send + Sync {
    async fn start_notifications(&self) -> Result<(), LinkError>;

    async fn stop_notifications(&self) -> Result<(), LinkError>;

    /// Opens a stream of the values notified from now on.
    async fn value_stream(&self) -> Result<NotificationStream, LinkError>;
}

/// Physical BLE link to one device.
#[async_trait]
pub trait BleLink: fmt::Debug + Send + Sync {
    async fn is_connected(&self) -> Result<bool, LinkError>;

    async fn connect(&self) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Re-discovers the service and both characteristics by identifier.
    async fn acquire_characteristics(
        &self,
        ids: &CharacteristicIds,
    ) -> Result<CharacteristicPair, LinkError>;

    /// Subscribes to connect/disconnect events for this device.
    async fn events(&self) -> Result<LinkEventStream, LinkError>;
}

/// The write and notify endpoints used for APDU exchanges.
#[derive(Debug, Clone)]
pub struct CharacteristicPair {
    pub write: Arc<dyn WriteEndpoint>,
    pub notify: Arc<dyn NotifyEndpoint>,
}

/// Listener invoked for every notified value.
pub type ValueHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

type ListenerSlot = Arc<Mutex<Option<ValueHandler>>>;

/// Stable read/write surface over replaceable characteristic endpoints.
///
/// Exactly one value listener is installed at a time. Notifications are pumped
/// from the notify endpoint to whichever listener occupies the slot when the
/// value arrives.
pub struct CharacteristicIo {
    link: Arc<dyn BleLink>,
    endpoints: Mutex<CharacteristicPair>,
    listener: ListenerSlot,
    pump: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for CharacteristicIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicIo")
            .field("endpoints", &*self.endpoints.lock())
            .field("has_listener", &self.has_listener())
            .finish_non_exhaustive()
    }
}

impl CharacteristicIo {
    #[must_use]
    pub fn new(link: Arc<dyn BleLink>, endpoints: CharacteristicPair) -> Self {
        Self {
            link,
            endpoints: Mutex::new(endpoints),
            listener: Arc::new(Mutex::new(None)),
            pump: Mutex::new(None),
        }
    }

    /// Returns the endpoints currently in use.
    #[must_use]
    pub fn endpoints(&self) -> CharacteristicPair {
        self.endpoints.lock().clone()
    }

    /// Writes one value to the write characteristic.
    ///
    /// # Errors
    ///
    /// Returns the link error reported by the endpoint.
    pub async fn write_value(&self, value: &[u8]) -> Result<(), LinkError> {
        let write = self.endpoints.lock().write.clone();
        write.write_value(value).await
    }

    /// Installs `handler` as the value listener, replacing any previous one.
    pub fn on_value_changed(&self, handler: ValueHandler) {
        if self.listener.lock().replace(handler).is_some() {
            trace!("replaced value listener");
        }
    }

    /// Removes the value listener.
    pub fn off_value_changed(&self) {
        self.listener.lock().take();
    }

    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Swaps in new endpoints, stopping the old notification pump and clearing
    /// the listener binding.
    pub fn replace_endpoints(&self, endpoints: CharacteristicPair) {
        self.stop_pump();
        self.off_value_changed();
        *self.endpoints.lock() = endpoints;
        debug!("replaced characteristic endpoints");
    }

    /// Starts notifications, reconnecting the link and retrying once on failure.
    ///
    /// # Errors
    ///
    /// Returns the link error of the retry, or of opening the value stream.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_notifications(&self) -> Result<(), LinkError> {
        let notify = self.endpoints.lock().notify.clone();
        if let Err(error) = notify.start_notifications().await {
            warn!(%error, "starting notifications failed, reconnecting and retrying once");
            self.link.connect().await?;
            notify.start_notifications().await?;
        }

        let values = notify.value_stream().await?;
        let token = CancellationToken::new();
        tokio::spawn(pump_notifications(
            values,
            Arc::clone(&self.listener),
            token.clone(),
        ));
        if let Some(previous) = self.pump.lock().replace(token) {
            previous.cancel();
        }
        Ok(())
    }

    /// Stops the notification pump and the notify endpoint.
    ///
    /// # Errors
    ///
    /// Returns the link error reported by the endpoint.
    pub async fn stop_notifications(&self) -> Result<(), LinkError> {
        self.stop_pump();
        let notify = self.endpoints.lock().notify.clone();
        notify.stop_notifications().await
    }

    fn stop_pump(&self) {
        if let Some(token) = self.pump.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for CharacteristicIo {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

async fn pump_notifications(
    mut values: NotificationStream,
    listener: ListenerSlot,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            maybe_value = values.next() => {
                let Some(value) = maybe_value else {
                    debug!("notification stream ended");
                    break;
                };
                // Clone out of the slot so a listener may replace itself.
                let handler = listener.lock().clone();
                match handler {
                    Some(handler) => handler(&value),
                    None => trace!(len = value.len(), "dropping notification without listener"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hw::FakeDevice;

    fn collecting_handler() -> (ValueHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: ValueHandler = Arc::new(move |value: &[u8]| sink.lock().push(value.to_vec()));
        (handler, seen)
    }

    #[tokio::test]
    async fn installing_a_listener_replaces_the_previous_one() -> anyhow::Result<()> {
        let device = FakeDevice::builder().build();
        let io = CharacteristicIo::new(device.link(), device.characteristics()?);
        let (first, first_seen) = collecting_handler();
        let (second, second_seen) = collecting_handler();

        io.on_value_changed(first);
        io.on_value_changed(second);
        io.start_notifications().await?;
        device.notify(&[0x01, 0x02]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(first_seen.lock().is_empty());
        assert_eq!(vec![vec![0x01, 0x02]], *second_seen.lock());
        Ok(())
    }

    #[tokio::test]
    async fn replacing_endpoints_clears_listener() -> anyhow::Result<()> {
        let device = FakeDevice::builder().build();
        let io = CharacteristicIo::new(device.link(), device.characteristics()?);
        let (handler, seen) = collecting_handler();
        io.on_value_changed(handler);
        io.start_notifications().await?;

        io.replace_endpoints(device.characteristics()?);
        device.notify(&[0x03]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!io.has_listener());
        assert!(seen.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn start_notifications_retries_once_after_reconnecting() -> anyhow::Result<()> {
        let device = FakeDevice::builder().build();
        let io = CharacteristicIo::new(device.link(), device.characteristics()?);
        device.fail_next_start_notifications(1);

        io.start_notifications().await?;

        assert_eq!(2, device.start_notification_attempts());
        assert_eq!(1, device.connect_calls());
        Ok(())
    }

    #[tokio::test]
    async fn start_notifications_gives_up_after_second_failure() -> anyhow::Result<()> {
        let device = FakeDevice::builder().build();
        let io = CharacteristicIo::new(device.link(), device.characteristics()?);
        device.fail_next_start_notifications(2);

        let result = io.start_notifications().await;

        assert!(result.is_err());
        assert_eq!(2, device.start_notification_attempts());
        Ok(())
    }
}
