//! Serial errors

use thiserror::Error;

/// Errors that can occur while opening or talking to a serial port
#[derive(Error, Debug)]
pub enum SerialError {
    /// Port could not be opened or configured
    #[error("Serial port error: {0}")]
    Port(String),

    /// No such port
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// A port with that name is already open
    #[error("Port already open: {0}")]
    AlreadyOpen(String),

    /// Read or write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_serial::Error> for SerialError {
    fn from(e: tokio_serial::Error) -> Self {
        match e.kind {
            tokio_serial::ErrorKind::NoDevice => SerialError::PortNotFound(e.description),
            _ => SerialError::Port(e.description),
        }
    }
}

/// Reasons an incoming frame is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame has no `|crc` suffix
    #[error("missing checksum")]
    MissingChecksum,

    /// Checksum does not match the frame
    #[error("checksum mismatch: calc: {calculated}, remote: {remote}")]
    ChecksumMismatch {
        /// Checksum of the received body
        calculated: u16,
        /// Checksum the sender appended
        remote: u16,
    },
}
