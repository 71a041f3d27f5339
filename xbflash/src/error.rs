//! Error types for xbflash.

use std::io;
use thiserror::Error;

/// Result type for xbflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for xbflash operations.
///
/// Errors returned from an install session's `tick()` are terminal: the
/// session enters its failure state and must not be driven any further.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Firmware image is malformed (bad magic, length or checksum).
    #[error("Invalid firmware image: {0}")]
    Validation(String),

    /// Firmware image does not match the attached hardware.
    #[error("Incompatible hardware: {0}")]
    IncompatibleHardware(String),

    /// No expected byte arrived before the deadline (after retries).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Wrong byte, bad echo or bad acknowledgement (after retries).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// XMODEM transfer was aborted and cancel bytes were sent.
    #[error("XMODEM transfer cancelled")]
    Cancelled,

    /// Transport refused a write.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Response buffer filled before a line terminator arrived.
    #[error("Response buffer full before end of line")]
    InsufficientSpace,

    /// Command mode cannot be left until the pending response arrives.
    #[error("Busy: waiting for a response, try again later")]
    Busy,

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Session already failed; it has to be discarded.
    #[error("Install session already failed")]
    SessionFailed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No serial device found.
    #[error("Device not found")]
    DeviceNotFound,
}

impl Error {
    /// Whether retrying the same operation could change the outcome.
    ///
    /// Image and hardware mismatches are permanent; everything that depends
    /// on link timing is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Protocol(_) | Self::Cancelled | Self::Busy
        )
    }
}
