use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Get-app-and-version command, also used as the post-disconnect probe.
pub const GET_APP_AND_VERSION: [u8; 5] = [0xb0, 0x01, 0x00, 0x00, 0x00];

/// Status word reported by the device when a command succeeded.
pub const SUCCESS_STATUS_WORD: u16 = 0x9000;

const OPEN_APP_PREFIX: [u8; 2] = [0xe0, 0xd8];
const QUIT_APP_PREFIX: [u8; 2] = [0xb0, 0xa7];

/// Response to one APDU: response data followed by a two-byte status word.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApduResponse {
    status_code: [u8; 2],
    data: Vec<u8>,
}

impl ApduResponse {
    /// Creates a response from its status word bytes and data.
    #[must_use]
    pub fn new(status_code: [u8; 2], data: Vec<u8>) -> Self {
        Self { status_code, data }
    }

    /// Splits a raw wire response (`data || SW1 SW2`).
    ///
    /// Returns `None` when fewer than two bytes are available.
    #[must_use]
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        let split = raw.len().checked_sub(2)?;
        let (data, status) = raw.split_at(split);
        Some(Self {
            status_code: [status[0], status[1]],
            data: data.to_vec(),
        })
    }

    /// Returns a plain `90 00` response without data.
    #[must_use]
    pub fn success() -> Self {
        Self::new(SUCCESS_STATUS_WORD.to_be_bytes(), Vec::new())
    }

    #[must_use]
    pub fn status_code(&self) -> [u8; 2] {
        self.status_code
    }

    /// Returns the status word as a big-endian integer.
    #[must_use]
    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes(self.status_code)
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns whether the status word is `0x9000`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_word() == SUCCESS_STATUS_WORD
    }

    /// Returns the response in wire order.
    #[must_use]
    pub fn to_raw(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.data.len() + 2);
        raw.extend_from_slice(&self.data);
        raw.extend_from_slice(&self.status_code);
        raw
    }
}

/// Decides whether a successful APDU is expected to make the device drop the link.
pub trait DisconnectionHeuristic: fmt::Debug + Send + Sync {
    fn triggers_disconnection(&self, apdu: &[u8]) -> bool;
}

/// Recognises the dashboard commands that restart the device transport:
/// open-app (`e0 d8`) and quit-app (`b0 a7`).
#[derive(Debug, Clone, Copy, Default)]
pub struct KnownDisconnectingCommands;

impl DisconnectionHeuristic for KnownDisconnectingCommands {
    fn triggers_disconnection(&self, apdu: &[u8]) -> bool {
        apdu.starts_with(&OPEN_APP_PREFIX) || apdu.starts_with(&QUIT_APP_PREFIX)
    }
}

/// Heuristic that only honours the caller's explicit flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverDisconnects;

impl DisconnectionHeuristic for NeverDisconnects {
    fn triggers_disconnection(&self, _apdu: &[u8]) -> bool {
        false
    }
}

/// Errors returned when decoding a get-app-and-version response.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AppVersionDecodeError {
    #[error("device returned status word {status_word:#06x}")]
    UnexpectedStatus { status_word: u16 },
    #[error("unsupported app-and-version format byte {format:#04x}")]
    UnsupportedFormat { format: u8 },
    #[error("app-and-version response ended while reading the {field}")]
    Truncated { field: &'static str },
}

/// Decoded get-app-and-version response.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct AppAndVersion {
    name: String,
    version: String,
    flags: Vec<u8>,
}

impl AppAndVersion {
    /// Decodes `format || len name || len version || len flags`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status word is not a success or the payload is
    /// truncated or uses an unknown format.
    pub fn decode(response: &ApduResponse) -> Result<Self, AppVersionDecodeError> {
        if !response.is_success() {
            return Err(AppVersionDecodeError::UnexpectedStatus {
                status_word: response.status_word(),
            });
        }

        let mut cursor = response.data();
        let format = take_byte(&mut cursor, "format byte")?;
        if format != 0x01 {
            return Err(AppVersionDecodeError::UnsupportedFormat { format });
        }
        let name = take_length_prefixed(&mut cursor, "app name")?;
        let version = take_length_prefixed(&mut cursor, "app version")?;
        // Older firmware stops after the version.
        let flags = if cursor.is_empty() {
            Vec::new()
        } else {
            take_length_prefixed(&mut cursor, "flags")?.to_vec()
        };

        Ok(Self {
            name: String::from_utf8_lossy(name).into_owned(),
            version: String::from_utf8_lossy(version).into_owned(),
            flags,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn flags(&self) -> &[u8] {
        &self.flags
    }
}

fn take_byte(cursor: &mut &[u8], field: &'static str) -> Result<u8, AppVersionDecodeError> {
    let (&first, rest) = cursor
        .split_first()
        .ok_or(AppVersionDecodeError::Truncated { field })?;
    *cursor = rest;
    Ok(first)
}

fn take_length_prefixed<'a>(
    cursor: &mut &'a [u8],
    field: &'static str,
) -> Result<&'a [u8], AppVersionDecodeError> {
    let length = usize::from(take_byte(cursor, field)?);
    if cursor.len() < length {
        return Err(AppVersionDecodeError::Truncated { field });
    }
    let (value, rest) = cursor.split_at(length);
    *cursor = rest;
    Ok(value)
}
