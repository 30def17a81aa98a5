//! Device errors

use thiserror::Error;

/// Errors from device commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// No acknowledgement within the timeout
    #[error("timeout waiting for ack ({device}:{command})")]
    AckTimeout {
        /// Device id the command was sent to
        device: String,
        /// Command text
        command: String,
    },

    /// Unknown device id
    #[error("device not found: {0}")]
    NotFound(String),

    /// No open port with that name
    #[error("serial port not open: {0}")]
    PortNotFound(String),
}
