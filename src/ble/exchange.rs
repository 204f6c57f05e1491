use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace, warn};

use super::characteristic::CharacteristicIo;
use super::mtu::MtuNegotiator;
use crate::apdu::ApduResponse;
use crate::error::DeviceExchangeError;
use crate::framing::FrameReceiver;
use crate::utils::format_hex;

type ExchangeResult = Result<ApduResponse, DeviceExchangeError>;
type PendingSlot = Arc<Mutex<Option<oneshot::Sender<ExchangeResult>>>>;

/// Frame-level request/response over [`CharacteristicIo`].
#[derive(Debug)]
pub struct ApduExchange {
    io: Arc<CharacteristicIo>,
    negotiator: Arc<MtuNegotiator>,
    receiver: Arc<Mutex<Box<dyn FrameReceiver>>>,
    pending: PendingSlot,
}

impl ApduExchange {
    #[must_use]
    pub fn new(
        io: Arc<CharacteristicIo>,
        negotiator: Arc<MtuNegotiator>,
        receiver: Box<dyn FrameReceiver>,
    ) -> Self {
        Self {
            io,
            negotiator,
            receiver: Arc::new(Mutex::new(receiver)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Installs the response listener on the characteristic I/O.
    pub fn attach(&self) {
        let receiver = Arc::clone(&self.receiver);
        let pending = Arc::clone(&self.pending);
        self.io.on_value_changed(Arc::new(move |frame: &[u8]| {
            let outcome = receiver.lock().handle_frame(frame);
            match outcome {
                Ok(None) => trace!(len = frame.len(), "buffered response frame"),
                Ok(Some(response)) => {
                    debug!(
                        status_word = format_args!("{:#06x}", response.status_word()),
                        data_len = response.data().len(),
                        "received APDU response"
                    );
                    settle(&pending, Ok(response));
                }
                Err(error) => {
                    warn!(%error, "failed to reassemble response frame");
                    receiver.lock().reset();
                    settle(&pending, Err(error.into()));
                }
            }
        }));
    }

    /// Removes the response listener.
    pub fn detach(&self) {
        self.io.off_value_changed();
    }

    /// Frames and writes `apdu`, then waits for the reassembled response.
    ///
    /// A failed frame write is logged and the remaining frames are still
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceExchangeError::DeviceNotInitialized`] without a
    /// negotiated frame size, a framing error, or
    /// [`DeviceExchangeError::SendApduTimeout`] when `abort_timeout` elapses.
    #[instrument(skip(self, apdu), level = "debug", fields(apdu = %format_hex(apdu)))]
    pub async fn send(
        &self,
        apdu: &[u8],
        abort_timeout: Option<Duration>,
    ) -> Result<ApduResponse, DeviceExchangeError> {
        let Some(frame_sender) = self.negotiator.frame_sender() else {
            return Err(DeviceExchangeError::not_initialized("frame size is unknown"));
        };
        let frames = frame_sender.frames(apdu)?;

        let (sender, response) = oneshot::channel();
        let replaced = self.pending.lock().replace(sender);
        if let Some(replaced) = replaced {
            debug!("superseding an unsettled exchange");
            let _ = replaced.send(Err(DeviceExchangeError::DeviceDisconnectedWhileSending));
        }

        for (frame_index, frame) in frames.iter().enumerate() {
            if let Err(error) = self.io.write_value(frame.as_bytes()).await {
                warn!(%error, frame_index, "failed to write APDU frame");
            }
        }
        trace!(frame_count = frames.len(), "wrote APDU frames");

        let outcome = match abort_timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().take();
                    self.reset_receiver();
                    return Err(DeviceExchangeError::SendApduTimeout { timeout: limit });
                }
            },
            None => response.await,
        };
        outcome.unwrap_or_else(|_| Err(DeviceExchangeError::unknown("response channel closed")))
    }

    /// Settles the in-flight exchange, if any, with `error`.
    pub fn fail_pending(&self, error: DeviceExchangeError) {
        settle(&self.pending, Err(error));
    }

    /// Drops partially reassembled response frames.
    pub fn reset_receiver(&self) {
        self.receiver.lock().reset();
    }
}

fn settle(pending: &PendingSlot, outcome: ExchangeResult) {
    let Some(sender) = pending.lock().take() else {
        debug!("dropping exchange outcome without a pending request");
        return;
    };
    let _ = sender.send(outcome);
}
