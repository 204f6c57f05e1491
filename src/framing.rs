//! APDU framing over fixed-size BLE frames.
//!
//! The connection layer only depends on the [`FrameSender`] and
//! [`FrameReceiver`] contracts. [`Framing::default`] provides the Ledger BLE
//! framing: every frame starts with the head tag `0x05` and a 2-byte big-endian
//! sequence index, and the first frame additionally carries the 2-byte
//! big-endian length of the whole message.

use std::fmt;
use std::num::NonZeroU8;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::apdu::ApduResponse;

pub(crate) const HEAD_TAG: u8 = 0x05;
const FRAME_HEADER_LEN: usize = 3;
pub(crate) const FIRST_FRAME_HEADER_LEN: usize = FRAME_HEADER_LEN + 2;

/// Errors returned while chunking or reassembling frames.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum FramingError {
    #[error("frame size {frame_size} cannot fit the {header_len}-byte frame header and any data")]
    FrameSizeTooSmall { frame_size: usize, header_len: usize },
    #[error("APDU of {len} bytes exceeds the maximum framed message length")]
    ApduTooLong { len: usize },
    #[error("received frame of {len} bytes is shorter than the frame header")]
    FrameTooShort { len: usize },
    #[error("received frame with unexpected head tag {tag:#04x}")]
    InvalidHeadTag { tag: u8 },
    #[error("received frame index {actual}, expected {expected}")]
    UnexpectedFrameIndex { expected: u16, actual: u16 },
    #[error("reassembled response of {len} bytes has no status word")]
    ResponseTooShort { len: usize },
}

/// Frame size negotiated with the device. Always non-zero.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
#[display("{_0}")]
pub struct FrameSize(NonZeroU8);

impl FrameSize {
    /// Returns `None` for a zero size.
    #[must_use]
    pub fn new(size: u8) -> Option<Self> {
        NonZeroU8::new(size).map(Self)
    }

    #[must_use]
    pub fn get(self) -> usize {
        usize::from(self.0.get())
    }
}

/// One framed chunk, ready to be written to the write characteristic.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::From, derive_more::Into)]
pub struct Frame(Vec<u8>);

impl Frame {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Splits an outgoing APDU into frames.
pub trait FrameSender: fmt::Debug + Send + Sync {
    /// Returns the frames for one APDU, in write order.
    ///
    /// # Errors
    ///
    /// Returns an error if the APDU cannot be represented with this frame size.
    fn frames(&self, apdu: &[u8]) -> Result<Vec<Frame>, FramingError>;
}

/// Accumulates incoming frames until a full response is available.
pub trait FrameReceiver: fmt::Debug + Send {
    /// Feeds one notification. Returns the response once the last frame arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame does not continue the current message.
    fn handle_frame(&mut self, frame: &[u8]) -> Result<Option<ApduResponse>, FramingError>;

    /// Drops any partially reassembled response.
    fn reset(&mut self);
}

pub type FrameSenderFactory = Arc<dyn Fn(FrameSize) -> Arc<dyn FrameSender> + Send + Sync>;
pub type FrameReceiverFactory = Arc<dyn Fn() -> Box<dyn FrameReceiver> + Send + Sync>;

/// Factories for the framing used by a connection.
#[derive(Clone)]
pub struct Framing {
    pub sender: FrameSenderFactory,
    pub receiver: FrameReceiverFactory,
}

impl fmt::Debug for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framing").finish_non_exhaustive()
    }
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            sender: Arc::new(|frame_size| Arc::new(LedgerBleFrameSender::new(frame_size))),
            receiver: Arc::new(|| Box::new(LedgerBleFrameReceiver::default())),
        }
    }
}

/// Frame sender for the Ledger BLE framing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LedgerBleFrameSender {
    frame_size: FrameSize,
}

impl LedgerBleFrameSender {
    #[must_use]
    pub fn new(frame_size: FrameSize) -> Self {
        Self { frame_size }
    }
}

impl FrameSender for LedgerBleFrameSender {
    fn frames(&self, apdu: &[u8]) -> Result<Vec<Frame>, FramingError> {
        encode_frames(apdu, self.frame_size.get())
    }
}

/// Splits a message into Ledger BLE frames of at most `frame_size` bytes.
pub(crate) fn encode_frames(message: &[u8], frame_size: usize) -> Result<Vec<Frame>, FramingError> {
    if frame_size <= FIRST_FRAME_HEADER_LEN {
        return Err(FramingError::FrameSizeTooSmall {
            frame_size,
            header_len: FIRST_FRAME_HEADER_LEN,
        });
    }
    let message_len = u16::try_from(message.len())
        .map_err(|_| FramingError::ApduTooLong { len: message.len() })?;

    let mut frames = Vec::new();
    let mut remaining = message;
    let mut index: u16 = 0;
    loop {
        let mut frame = Vec::with_capacity(frame_size);
        frame.push(HEAD_TAG);
        frame.extend_from_slice(&index.to_be_bytes());
        if index == 0 {
            frame.extend_from_slice(&message_len.to_be_bytes());
        }
        let take = remaining.len().min(frame_size - frame.len());
        let (chunk, rest) = remaining.split_at(take);
        frame.extend_from_slice(chunk);
        frames.push(Frame(frame));
        remaining = rest;

        if remaining.is_empty() {
            return Ok(frames);
        }
        index = index
            .checked_add(1)
            .ok_or(FramingError::ApduTooLong { len: message.len() })?;
    }
}

/// Reassembles Ledger BLE frames into the raw message bytes.
#[derive(Debug, Default)]
pub(crate) struct FrameReassembler {
    expected_len: Option<usize>,
    next_index: u16,
    buffer: Vec<u8>,
}

impl FrameReassembler {
    pub(crate) fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, FramingError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(FramingError::FrameTooShort { len: frame.len() });
        }
        if frame[0] != HEAD_TAG {
            return Err(FramingError::InvalidHeadTag { tag: frame[0] });
        }
        let index = u16::from_be_bytes([frame[1], frame[2]]);
        if index != self.next_index {
            let expected = self.next_index;
            self.reset();
            return Err(FramingError::UnexpectedFrameIndex {
                expected,
                actual: index,
            });
        }

        let data = if index == 0 {
            if frame.len() < FIRST_FRAME_HEADER_LEN {
                return Err(FramingError::FrameTooShort { len: frame.len() });
            }
            self.expected_len = Some(usize::from(u16::from_be_bytes([frame[3], frame[4]])));
            self.buffer.clear();
            &frame[FIRST_FRAME_HEADER_LEN..]
        } else {
            &frame[FRAME_HEADER_LEN..]
        };
        self.buffer.extend_from_slice(data);
        self.next_index = self.next_index.wrapping_add(1);

        let expected_len = self.expected_len.unwrap_or_default();
        if self.buffer.len() < expected_len {
            trace!(
                received = self.buffer.len(),
                expected = expected_len,
                "waiting for more frames"
            );
            return Ok(None);
        }

        let mut message = std::mem::take(&mut self.buffer);
        message.truncate(expected_len);
        self.reset();
        Ok(Some(message))
    }

    pub(crate) fn reset(&mut self) {
        self.expected_len = None;
        self.next_index = 0;
        self.buffer.clear();
    }
}

/// Frame receiver for the Ledger BLE framing.
#[derive(Debug, Default)]
pub struct LedgerBleFrameReceiver {
    reassembler: FrameReassembler,
}

impl FrameReceiver for LedgerBleFrameReceiver {
    fn handle_frame(&mut self, frame: &[u8]) -> Result<Option<ApduResponse>, FramingError> {
        let Some(message) = self.reassembler.push(frame)? else {
            return Ok(None);
        };
        ApduResponse::from_raw(&message)
            .map(Some)
            .ok_or(FramingError::ResponseTooShort { len: message.len() })
    }

    fn reset(&mut self) {
        self.reassembler.reset();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn frame_size(size: u8) -> FrameSize {
        FrameSize::new(size).expect("test frame sizes are non-zero")
    }

    #[test]
    fn frame_size_rejects_zero() {
        assert_eq!(None, FrameSize::new(0));
    }

    #[test]
    fn short_apdu_fits_in_one_frame() {
        let frames = LedgerBleFrameSender::new(frame_size(20))
            .frames(&[0xb0, 0x01, 0x00, 0x00, 0x00])
            .expect("short APDU should frame");

        assert_eq!(
            vec![Frame::from(vec![
                0x05, 0x00, 0x00, 0x00, 0x05, 0xb0, 0x01, 0x00, 0x00, 0x00
            ])],
            frames
        );
    }

    #[test]
    fn long_apdu_is_split_with_increasing_indexes() {
        let apdu: Vec<u8> = (0..10).collect();

        let frames = LedgerBleFrameSender::new(frame_size(8))
            .frames(&apdu)
            .expect("APDU should frame");

        assert_eq!(
            vec![
                Frame::from(vec![0x05, 0x00, 0x00, 0x00, 0x0a, 0, 1, 2]),
                Frame::from(vec![0x05, 0x00, 0x01, 3, 4, 5, 6, 7]),
                Frame::from(vec![0x05, 0x00, 0x02, 8, 9]),
            ],
            frames
        );
    }

    #[test]
    fn empty_apdu_still_produces_a_header_frame() {
        let frames = encode_frames(&[], 20).expect("empty message should frame");

        assert_eq!(vec![Frame::from(vec![0x05, 0x00, 0x00, 0x00, 0x00])], frames);
    }

    #[rstest]
    #[case(1)]
    #[case(5)]
    fn frame_size_must_exceed_first_header(#[case] size: u8) {
        assert_matches!(
            LedgerBleFrameSender::new(frame_size(size)).frames(&[0x01]),
            Err(FramingError::FrameSizeTooSmall { .. })
        );
    }

    #[test]
    fn receiver_reassembles_multi_frame_response() {
        let mut receiver = LedgerBleFrameReceiver::default();

        let first = receiver
            .handle_frame(&[0x05, 0x00, 0x00, 0x00, 0x04, 0xaa, 0xbb])
            .expect("first frame should be accepted");
        let second = receiver
            .handle_frame(&[0x05, 0x00, 0x01, 0x90, 0x00])
            .expect("second frame should be accepted");

        assert_eq!(None, first);
        assert_eq!(
            Some(ApduResponse::new([0x90, 0x00], vec![0xaa, 0xbb])),
            second
        );
    }

    #[test]
    fn receiver_ignores_trailing_padding() {
        let mut receiver = LedgerBleFrameReceiver::default();

        let response = receiver
            .handle_frame(&[0x05, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00, 0x00, 0x00])
            .expect("padded frame should be accepted");

        assert_eq!(Some(ApduResponse::success()), response);
    }

    #[test]
    fn receiver_rejects_out_of_order_frame_and_recovers() {
        let mut receiver = LedgerBleFrameReceiver::default();

        let error = receiver
            .handle_frame(&[0x05, 0x00, 0x01, 0x90, 0x00])
            .expect_err("frame 1 without frame 0 should fail");
        let recovered = receiver
            .handle_frame(&[0x05, 0x00, 0x00, 0x00, 0x02, 0x90, 0x00])
            .expect("a fresh first frame should be accepted");

        assert_eq!(
            FramingError::UnexpectedFrameIndex {
                expected: 0,
                actual: 1
            },
            error
        );
        assert_eq!(Some(ApduResponse::success()), recovered);
    }

    #[rstest]
    #[case(&[0x05, 0x00], FramingError::FrameTooShort { len: 2 })]
    #[case(&[0x08, 0x00, 0x00, 0x00], FramingError::InvalidHeadTag { tag: 0x08 })]
    #[case(&[0x05, 0x00, 0x00, 0x00, 0x01, 0x90], FramingError::ResponseTooShort { len: 1 })]
    fn receiver_reports_malformed_frames(#[case] frame: &[u8], #[case] expected: FramingError) {
        let mut receiver = LedgerBleFrameReceiver::default();

        assert_eq!(Err(expected), receiver.handle_frame(frame));
    }

    #[test]
    fn frames_round_trip_through_the_reassembler() {
        let message: Vec<u8> = (0..=200).collect();
        let mut reassembler = FrameReassembler::default();

        let mut reassembled = None;
        for frame in encode_frames(&message, 23).expect("message should frame") {
            reassembled = reassembler
                .push(frame.as_bytes())
                .expect("frames should reassemble");
        }

        assert_eq!(Some(message), reassembled);
    }
}
