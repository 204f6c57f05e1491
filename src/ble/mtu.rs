use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, trace};

use super::characteristic::CharacteristicIo;
use crate::error::DeviceExchangeError;
use crate::framing::{FrameSender, FrameSenderFactory, FrameSize};
use crate::protocol::{MTU_REPLY_SIZE_OFFSET, MTU_REQUEST};

#[derive(Debug, Clone)]
struct Negotiated {
    frame_size: FrameSize,
    frame_sender: Arc<dyn FrameSender>,
}

/// Discovers the device frame size once per physical connection.
pub struct MtuNegotiator {
    io: Arc<CharacteristicIo>,
    frame_sender_factory: FrameSenderFactory,
    negotiation_timeout: Duration,
    negotiated: Mutex<Option<Negotiated>>,
}

impl std::fmt::Debug for MtuNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtuNegotiator")
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("frame_size", &self.frame_size())
            .finish_non_exhaustive()
    }
}

impl MtuNegotiator {
    #[must_use]
    pub fn new(
        io: Arc<CharacteristicIo>,
        frame_sender_factory: FrameSenderFactory,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            io,
            frame_sender_factory,
            negotiation_timeout,
            negotiated: Mutex::new(None),
        }
    }

    /// Runs the MTU handshake and builds the frame sender for the reported size.
    ///
    /// The temporary listener occupies the value-listener slot until the
    /// handshake ends, successfully or not.
    ///
    /// # Errors
    ///
    /// Returns a link error if notifications cannot start or the request cannot
    /// be written, and [`DeviceExchangeError::DeviceNotInitialized`] if no
    /// usable reply arrives within the negotiation timeout.
    #[instrument(skip(self), level = "debug")]
    pub async fn negotiate(&self) -> Result<FrameSize, DeviceExchangeError> {
        let (reply_sender, reply_receiver) = oneshot::channel();
        let reply_sender = Mutex::new(Some(reply_sender));
        self.io.on_value_changed(Arc::new(move |value: &[u8]| {
            let Some(frame_size) = parse_mtu_reply(value) else {
                trace!(len = value.len(), "ignoring notification without a usable frame size");
                return;
            };
            if let Some(sender) = reply_sender.lock().take() {
                let _ = sender.send(frame_size);
            }
        }));

        let outcome = self.handshake(reply_receiver).await;
        self.io.off_value_changed();
        let frame_size = outcome?;

        let frame_sender = (self.frame_sender_factory)(frame_size);
        *self.negotiated.lock() = Some(Negotiated {
            frame_size,
            frame_sender,
        });
        info!(%frame_size, "negotiated frame size");
        Ok(frame_size)
    }

    async fn handshake(
        &self,
        reply: oneshot::Receiver<FrameSize>,
    ) -> Result<FrameSize, DeviceExchangeError> {
        self.io.start_notifications().await?;
        self.io.write_value(&MTU_REQUEST).await?;
        debug!("sent MTU request");

        match tokio::time::timeout(self.negotiation_timeout, reply).await {
            Ok(Ok(frame_size)) => Ok(frame_size),
            Ok(Err(_)) => Err(DeviceExchangeError::not_initialized(
                "MTU listener was replaced before a reply arrived",
            )),
            Err(_) => Err(DeviceExchangeError::not_initialized(format!(
                "no MTU reply within {}",
                humantime::format_duration(self.negotiation_timeout)
            ))),
        }
    }

    /// Returns whether a frame size is known.
    #[must_use]
    pub fn ready_state(&self) -> bool {
        self.negotiated.lock().is_some()
    }

    #[must_use]
    pub fn frame_size(&self) -> Option<FrameSize> {
        self.negotiated.lock().as_ref().map(|negotiated| negotiated.frame_size)
    }

    #[must_use]
    pub fn frame_sender(&self) -> Option<Arc<dyn FrameSender>> {
        self.negotiated
            .lock()
            .as_ref()
            .map(|negotiated| Arc::clone(&negotiated.frame_sender))
    }

    /// Forgets the negotiated size so the next exchange requires a new handshake.
    pub fn reset(&self) {
        if self.negotiated.lock().take().is_some() {
            debug!("cleared negotiated frame size");
        }
    }
}

/// Extracts the frame size from an MTU reply. Zero and short replies yield `None`.
pub(crate) fn parse_mtu_reply(value: &[u8]) -> Option<FrameSize> {
    value
        .get(MTU_REPLY_SIZE_OFFSET)
        .copied()
        .and_then(FrameSize::new)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::framing::Framing;
    use crate::hw::FakeDevice;

    fn negotiator(device: &FakeDevice, timeout: Duration) -> anyhow::Result<MtuNegotiator> {
        let io = Arc::new(CharacteristicIo::new(device.link(), device.characteristics()?));
        Ok(MtuNegotiator::new(io, Framing::default().sender, timeout))
    }

    #[rstest]
    #[case(&[0x08, 0x00, 0x00, 0x00, 0x00, 0x99], Some(0x99))]
    #[case(&[0x08, 0x00, 0x00, 0x00, 0x00, 0x00], None)]
    #[case(&[0x08, 0x00, 0x00, 0x00, 0x00], None)]
    #[case(&[], None)]
    fn parse_mtu_reply_reads_byte_five(#[case] value: &[u8], #[case] expected: Option<u8>) {
        assert_eq!(expected.and_then(FrameSize::new), parse_mtu_reply(value));
    }

    #[tokio::test]
    async fn negotiate_sets_frame_size_and_detaches_listener() -> anyhow::Result<()> {
        let device = FakeDevice::builder().mtu(0x99).build();
        let negotiator = negotiator(&device, Duration::from_secs(2))?;

        let frame_size = negotiator.negotiate().await?;

        assert_eq!(0x99, frame_size.get());
        assert!(negotiator.ready_state());
        assert!(negotiator.frame_sender().is_some());
        assert!(!negotiator.io.has_listener());
        assert_eq!(vec![MTU_REQUEST.to_vec()], device.written_frames());
        Ok(())
    }

    #[tokio::test]
    async fn zero_sized_reply_is_ignored_until_a_real_size_arrives() -> anyhow::Result<()> {
        let device = FakeDevice::builder()
            .mtu(0x40)
            .zero_mtu_replies_first(1)
            .build();
        let negotiator = negotiator(&device, Duration::from_secs(2))?;

        let frame_size = negotiator.negotiate().await?;

        assert_eq!(0x40, frame_size.get());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_times_out_without_reply() -> anyhow::Result<()> {
        let device = FakeDevice::builder().ignore_mtu_requests(true).build();
        let negotiator = negotiator(&device, Duration::from_secs(2))?;

        let result = negotiator.negotiate().await;

        assert_matches!(result, Err(DeviceExchangeError::DeviceNotInitialized { .. }));
        assert!(!negotiator.ready_state());
        assert!(!negotiator.io.has_listener());
        Ok(())
    }

    #[tokio::test]
    async fn reset_clears_readiness() -> anyhow::Result<()> {
        let device = FakeDevice::builder().build();
        let negotiator = negotiator(&device, Duration::from_secs(2))?;
        negotiator.negotiate().await?;

        negotiator.reset();

        assert!(!negotiator.ready_state());
        assert_eq!(None, negotiator.frame_size());
        Ok(())
    }
}
