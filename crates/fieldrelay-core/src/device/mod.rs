//! Serial devices
//!
//! A device is a logical endpoint on a serial port, addressed by a short id
//! that is unique per port. Every device understands the base messages
//! (`ack`, `log`, `updateSequence`); device types extend that set through
//! [`Device::handle_extended`].

mod auto;
mod error;
pub mod protocol;
mod registry;
pub mod usb;

pub use auto::{AutoDevice, AutoDeviceInfo, AutoDevices, InputHandler, MetaDevice, META_DEVICE_ID};
pub use error::DeviceError;
pub use protocol::{send_command, AckState, CommandOptions};
pub use registry::{DeviceRegistry, SerialHandler};
pub use usb::UsbWatcher;

use serde_json::Value;
use std::sync::Mutex;

/// One message received from a device, split into command and arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    /// First word of the payload
    pub command: String,
    /// Remaining whitespace-separated words
    pub args: Vec<String>,
    /// Whole payload after the device id
    pub text: String,
}

impl DeviceMessage {
    /// Split a payload on whitespace; `None` for an empty payload
    pub fn parse(payload: &str) -> Option<Self> {
        let text = payload.trim();
        let mut parts = text.split_whitespace();
        let command = parts.next()?.to_string();
        Some(Self {
            command,
            args: parts.map(str::to_string).collect(),
            text: text.to_string(),
        })
    }

    /// Payload text after the command word
    pub fn remainder(&self) -> &str {
        self.text[self.command.len()..].trim()
    }
}

/// Context available to device handlers while a message is dispatched
pub struct DeviceContext<'a> {
    /// Registry the device belongs to
    pub registry: &'a DeviceRegistry,
}

/// Mutable per-device state
#[derive(Debug)]
struct DeviceState {
    last_ack: String,
    polling_enabled: bool,
}

/// Identity and protocol state shared by all device types
#[derive(Debug)]
pub struct DeviceCore {
    id: String,
    port_name: String,
    state: Mutex<DeviceState>,
}

impl DeviceCore {
    /// Device `id` on the port named `port_name`, with polling off
    pub fn new(id: impl Into<String>, port_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            port_name: port_name.into(),
            state: Mutex::new(DeviceState {
                last_ack: String::new(),
                polling_enabled: false,
            }),
        }
    }

    /// Bus address, unique per port
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the port the device is attached to
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Text of the most recent acknowledgement
    pub fn last_ack(&self) -> String {
        self.state().last_ack.clone()
    }

    /// Record an acknowledgement received from the device
    pub fn set_last_ack(&self, ack: &str) {
        self.state().last_ack = ack.to_string();
    }

    /// Forget the last acknowledgement before sending a command
    pub fn clear_ack(&self) {
        self.state().last_ack.clear();
    }

    /// Whether the polling loop sends `q` to this device
    pub fn polling_enabled(&self) -> bool {
        self.state().polling_enabled
    }

    /// Include this device in the polling loop
    pub fn enable_polling(&self, enabled: bool) {
        self.state().polling_enabled = enabled;
    }

    /// Handle the messages every device understands
    pub fn handle_base(&self, message: &DeviceMessage, ctx: &DeviceContext<'_>) -> bool {
        match message.command.as_str() {
            "ack" | "ack:" => {
                self.set_last_ack(message.remainder());
                true
            }
            "log" | "log:" if !message.args.is_empty() => {
                ctx.registry
                    .sequences()
                    .update("log", format!("{}: {}", self.id, message.remainder()));
                true
            }
            "updateSequence" if message.args.len() >= 2 => {
                let value = convert_value(&message.args[1..].join(" "));
                ctx.registry.sequences().update(&message.args[0], value);
                true
            }
            _ => false,
        }
    }
}

/// A device on a serial port
pub trait Device: Send + Sync {
    /// Identity and protocol state
    fn core(&self) -> &DeviceCore;

    /// Messages specific to this device type; returns true when handled
    fn handle_extended(&self, _message: &DeviceMessage, _ctx: &DeviceContext<'_>) -> bool {
        false
    }

    /// Base messages first, then the device type's own
    fn handle_message(&self, message: &DeviceMessage, ctx: &DeviceContext<'_>) -> bool {
        self.core().handle_base(message, ctx) || self.handle_extended(message, ctx)
    }
}

/// A device with no messages beyond the base set
#[derive(Debug)]
pub struct BasicDevice {
    core: DeviceCore,
}

impl BasicDevice {
    /// Device `id` on `port_name`
    pub fn new(id: impl Into<String>, port_name: impl Into<String>) -> Self {
        Self {
            core: DeviceCore::new(id, port_name),
        }
    }
}

impl Device for BasicDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

/// Convert a text value to an integer, else a float, else keep the string
pub fn convert_value(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_message() {
        let msg = DeviceMessage::parse(" v 1.5  2 ").unwrap();
        assert_eq!(msg.command, "v");
        assert_eq!(msg.args, vec!["1.5", "2"]);
        assert_eq!(msg.remainder(), "1.5  2");
        assert!(DeviceMessage::parse("   ").is_none());
    }

    #[test]
    fn test_ack_remainder() {
        let msg = DeviceMessage::parse("ack checksum 1").unwrap();
        assert_eq!(msg.remainder(), "checksum 1");
        let msg = DeviceMessage::parse("ack: q").unwrap();
        assert_eq!(msg.command, "ack:");
        assert_eq!(msg.remainder(), "q");
    }

    #[test]
    fn test_convert_value() {
        assert_eq!(convert_value("12"), json!(12));
        assert_eq!(convert_value("-3.25"), json!(-3.25));
        assert_eq!(convert_value("open valve"), json!("open valve"));
        assert_eq!(convert_value("nan"), json!("nan"));
    }

    #[test]
    fn test_polling_flag() {
        let core = DeviceCore::new("a", "sim");
        assert!(!core.polling_enabled());
        core.enable_polling(true);
        assert!(core.polling_enabled());
        assert_eq!(core.port_name(), "sim");
    }
}
