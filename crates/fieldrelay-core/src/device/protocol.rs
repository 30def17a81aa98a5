//! Command/acknowledgement handshake
//!
//! Each command is written as `<id>:<command>` and the device answers
//! `ack <command>`. Unacknowledged commands are resent every ack window
//! until the overall timeout. When a corrupt frame arrived during the
//! window, the device is asked to repeat its last reply (`qr`) instead of
//! trusting whatever ack was seen.

use std::time::Duration;
use tokio::time::{sleep, Instant};

use super::{DeviceCore, DeviceError};
use crate::config::Config;
use crate::serial::frame::BROADCAST_ID;
use crate::serial::SerialPort;

/// Overall time allowed for a command to be acknowledged
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Time to wait for an ack before resending
pub const ACK_WINDOW: Duration = Duration::from_secs(2);

/// How often the last ack is checked while waiting
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Command asking a device to resend its last reply
pub const RESEND_COMMAND: &str = "qr";

/// Progress of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Ready to write the command
    Idle,
    /// Written; waiting for the matching ack
    AwaitingAck,
    /// Acknowledged
    Acked,
    /// The device will be asked to repeat its last reply
    ResendRequested,
    /// No ack before the overall timeout
    TimedOut,
}

/// Command settings
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Give up after this long
    pub timeout: Duration,
    /// Resend when no ack arrives within this window
    pub ack_window: Duration,
    /// Ack check interval
    pub poll_interval: Duration,
    /// Request a resend when a checksum error coincides with the ack
    pub resend_on_checksum_error: bool,
    /// Log poll (`q`) commands
    pub log_polls: bool,
    /// Log outgoing commands at all
    pub log_commands: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            ack_window: ACK_WINDOW,
            poll_interval: ACK_POLL_INTERVAL,
            resend_on_checksum_error: false,
            log_polls: false,
            log_commands: true,
        }
    }
}

impl CommandOptions {
    /// Options from the `serial.*` config entries
    pub fn from_config(config: &Config) -> Self {
        Self {
            resend_on_checksum_error: config.get_bool("serial.enable_polling_resends", false),
            log_polls: !config.get_bool("serial.quiet_polling", true),
            log_commands: config.get_bool("serial.log_messages", true),
            ..Self::default()
        }
    }

    /// Same options with a different overall timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Send a command to a device and wait for its acknowledgement.
///
/// Holds the port for the whole exchange. Broadcast commands are written
/// once and never acknowledged.
pub async fn send_command(
    port: &SerialPort,
    device: &DeviceCore,
    command: &str,
    options: &CommandOptions,
) -> Result<(), DeviceError> {
    let id = device.id();
    if id == BROADCAST_ID {
        tracing::debug!("sending broadcast command {}", command);
        port.write_command(&format!("{}:{}", id, command)).await;
        return Ok(());
    }

    let _guard = port.acquire().await;
    device.clear_ack();

    let deadline = Instant::now() + options.timeout;
    let mut state = AckState::Idle;
    let mut attempts = 0u32;

    loop {
        port.clear_checksum_error();

        let expected = if state == AckState::ResendRequested {
            tracing::debug!("requesting resend {}:{}", id, command);
            RESEND_COMMAND
        } else {
            if options.log_commands && (command != "q" || options.log_polls) {
                tracing::debug!("sending {}:{}", id, command);
            }
            if attempts > 0 {
                tracing::debug!("resend {}: {}:{}", attempts, id, command);
            }
            attempts += 1;
            command
        };
        port.write_command(&format!("{}:{}", id, expected)).await;
        let resending = state == AckState::ResendRequested;
        state = AckState::AwaitingAck;

        let window_end = (Instant::now() + options.ack_window).min(deadline);
        let mut matched = false;
        loop {
            let now = Instant::now();
            if now >= window_end {
                break;
            }
            sleep(options.poll_interval.min(window_end - now)).await;
            if device.last_ack() == expected {
                matched = true;
                break;
            }
        }

        if matched {
            if options.resend_on_checksum_error && port.checksum_error() {
                state = AckState::ResendRequested;
            } else {
                state = AckState::Acked;
                tracing::trace!("{}:{} {:?}", id, command, state);
                return Ok(());
            }
        } else if resending {
            // the resend request itself went unanswered; ask again
            state = AckState::ResendRequested;
        }

        if Instant::now() >= deadline {
            state = AckState::TimedOut;
            tracing::trace!("{}:{} {:?}", id, command, state);
            return Err(DeviceError::AckTimeout {
                device: id.to_string(),
                command: command.to_string(),
            });
        }
        if state == AckState::AwaitingAck {
            state = AckState::Idle;
        }
    }
}
