//! Error types for the attach sequence.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::firmware::LoadStep;
use crate::h5::FramingError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("device {path} unavailable: {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure transport for {baud_rate} baud: {source}")]
    ConfigFailed {
        baud_rate: u32,
        #[source]
        source: io::Error,
    },

    #[error("no complete frame within {0:?}")]
    Timeout(Duration),

    #[error("write to transport failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("read from transport failed: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("transport closed")]
    Disconnected,

    #[error("malformed frame: {0}")]
    Framing(#[from] FramingError),

    #[error("sequence mismatch: expected {expected}, received {received}")]
    SequenceMismatch { expected: u8, received: u8 },

    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("no event 0x{event_code:02x} after {attempts} attempts")]
    NoResponse { event_code: u8, attempts: usize },

    #[error("event for opcode 0x{opcode:04x} failed checksum validation")]
    ChecksumMismatch { opcode: u16 },

    #[error("event for opcode 0x{opcode:04x} too short: {len} bytes")]
    MalformedEvent { opcode: u16, len: usize },

    #[error("invalid firmware: {0}")]
    InvalidFirmware(String),

    #[error("cannot read firmware {path}: {source}")]
    FirmwareUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config blob: {len} bytes (max {max})")]
    InvalidConfig { len: usize, max: usize },

    #[error("firmware load failed during {step}: {source}")]
    FirmwareLoadFailed {
        step: LoadStep,
        #[source]
        source: Box<Error>,
    },

    #[error("baud switch to {baud_rate} failed: {source}")]
    BaudSwitchFailed {
        baud_rate: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether a caller may reissue the command that produced this error.
    ///
    /// Errors that leave the link in an unknown synchronization state are
    /// never retryable; recovery from those is a fresh attach.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Framing(_)
                | Error::NoResponse { .. }
                | Error::ChecksumMismatch { .. }
        )
    }

    /// Whether the link can no longer be trusted to carry another exchange.
    pub fn desynchronizes(&self) -> bool {
        matches!(
            self,
            Error::SequenceMismatch { .. }
                | Error::Disconnected
                | Error::ReadFailed(_)
                | Error::WriteFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
