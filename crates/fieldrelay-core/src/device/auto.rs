//! Self-describing USB sensors and actuators
//!
//! Each USB serial port carries a `meta` device that lists the devices
//! behind it. Those devices describe themselves (`type`, `model`, `units`,
//! ...) and then stream values (`v`) or accept `set` commands.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, RwLock};

use super::{Device, DeviceContext, DeviceCore, DeviceMessage};
use crate::messages::{Envelope, HandlerOutcome};

/// Called with a sensor name and its latest values
pub type InputHandler = Arc<dyn Fn(&str, &[f64]) + Send + Sync>;

/// Description of an auto device as reported to the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoDeviceInfo {
    /// Name assigned by the user or the server
    pub name: Option<String>,
    /// `in` for sensors, `out` for actuators
    pub dir: String,
    /// Reported type, e.g. `temperature`
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    /// Hardware model
    pub model: Option<String>,
    /// Firmware version
    pub version: Option<String>,
    /// Units of the reported values
    pub units: Option<String>,
    /// Whether values are stored in a sequence
    pub store_sequence: bool,
}

impl Default for AutoDeviceInfo {
    fn default() -> Self {
        Self {
            name: None,
            dir: "in".to_string(),
            device_type: None,
            model: None,
            version: None,
            units: None,
            store_sequence: false,
        }
    }
}

impl AutoDeviceInfo {
    /// JSON sent with `device_added`/`device_removed`
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct AutoDeviceState {
    info: AutoDeviceInfo,
    sent_info: bool,
}

/// A sensor or actuator that identifies itself over the serial line
#[derive(Debug)]
pub struct AutoDevice {
    core: DeviceCore,
    state: Mutex<AutoDeviceState>,
}

impl AutoDevice {
    /// Device `id` on `port_name`, type not yet reported
    pub fn new(id: impl Into<String>, port_name: impl Into<String>) -> Self {
        Self {
            core: DeviceCore::new(id, port_name),
            state: Mutex::new(AutoDeviceState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AutoDeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the reported description
    pub fn info(&self) -> AutoDeviceInfo {
        self.state().info.clone()
    }

    /// Current name, if any
    pub fn name(&self) -> Option<String> {
        self.state().info.name.clone()
    }

    /// Rename the device
    pub fn set_name(&self, name: &str) {
        self.state().info.name = Some(name.to_string());
    }

    /// Reported type, once known
    pub fn device_type(&self) -> Option<String> {
        self.state().info.device_type.clone()
    }

    /// Store this sensor's values in a sequence named after it
    pub fn set_store_sequence(&self, store: bool) {
        self.state().info.store_sequence = store;
    }

    fn handle_values(&self, message: &DeviceMessage, ctx: &DeviceContext<'_>) {
        let (name, first_report, info) = {
            let mut state = self.state();
            let Some(name) = state.info.name.clone() else {
                return;
            };
            let first = !state.sent_info;
            state.sent_info = true;
            (name, first, state.info.clone())
        };

        let values: Result<Vec<f64>, _> = message.args.iter().map(|a| a.parse::<f64>()).collect();
        let values = match values {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("invalid sensor values from {}: {}", name, message.text);
                return;
            }
        };

        let queue = ctx.registry.queue();
        if first_report {
            queue.send("device_added", info.to_value());
        }
        queue.send("sensor_update", json!({"name": name, "values": values}));
        ctx.registry.auto_devices().run_input_handlers(&name, &values);
        if info.store_sequence {
            if let Some(first) = values.first() {
                ctx.registry.sequences().update(&name, *first);
            }
        }
    }
}

impl Device for AutoDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn handle_extended(&self, message: &DeviceMessage, ctx: &DeviceContext<'_>) -> bool {
        let joined = || message.args.join(" ");
        match message.command.as_str() {
            "v" => self.handle_values(message, ctx),
            "button" => {
                if let Some(name) = self.name() {
                    ctx.registry
                        .queue()
                        .send("device_button", json!({ "name": name }));
                }
            }
            "dir" if !message.args.is_empty() => self.state().info.dir = message.args[0].clone(),
            "type" if !message.args.is_empty() => {
                let device_type = joined();
                let needs_name = {
                    let mut state = self.state();
                    state.info.device_type = Some(device_type.clone());
                    state.info.name.is_none()
                };
                if needs_name {
                    // lookup walks every auto device, so no lock may be held here
                    let name = ctx.registry.auto_devices().assign_name(&device_type);
                    self.set_name(&name);
                }
            }
            "model" if !message.args.is_empty() => self.state().info.model = Some(joined()),
            "ver" if !message.args.is_empty() => self.state().info.version = Some(joined()),
            "units" if !message.args.is_empty() => self.state().info.units = Some(joined()),
            "ready" => {
                let info = {
                    let mut state = self.state();
                    state.sent_info = true;
                    state.info.clone()
                };
                ctx.registry.queue().send("device_added", info.to_value());
                if info.dir == "in" {
                    ctx.registry
                        .spawn_commands(self.core.port_name(), self.core.id(), &["interval 1"]);
                }
            }
            _ => return false,
        }
        true
    }
}

/// The `meta` device of a USB port; lists the devices behind the port
#[derive(Debug)]
pub struct MetaDevice {
    core: DeviceCore,
}

/// Id of the meta device on every USB port
pub const META_DEVICE_ID: &str = "meta";

impl MetaDevice {
    /// Meta device on `port_name`
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            core: DeviceCore::new(META_DEVICE_ID, port_name),
        }
    }
}

impl Device for MetaDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn handle_extended(&self, message: &DeviceMessage, ctx: &DeviceContext<'_>) -> bool {
        if message.command != "devices" {
            return false;
        }
        let port_name = self.core.port_name();
        for id in &message.args {
            let device = Arc::new(AutoDevice::new(id.as_str(), port_name));
            ctx.registry.auto_devices().add(device.clone());
            ctx.registry.register_device(device);
            ctx.registry
                .spawn_commands(port_name, id, &["checksum 1", "info"]);
        }
        true
    }
}

/// The set of auto devices and their input handlers
#[derive(Default)]
pub struct AutoDevices {
    devices: Mutex<Vec<Arc<AutoDevice>>>,
    input_handlers: RwLock<Vec<InputHandler>>,
}

impl AutoDevices {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<AutoDevice>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new auto device
    pub fn add(&self, device: Arc<AutoDevice>) {
        self.lock().push(device);
    }

    /// All auto devices, in discovery order
    pub fn list(&self) -> Vec<Arc<AutoDevice>> {
        self.lock().clone()
    }

    /// Devices that have not reported a type yet
    pub fn without_type(&self) -> Vec<Arc<AutoDevice>> {
        self.list()
            .into_iter()
            .filter(|d| d.device_type().is_none())
            .collect()
    }

    /// Find a device by its (user-visible) name
    pub fn find(&self, name: &str) -> Option<Arc<AutoDevice>> {
        self.list()
            .into_iter()
            .find(|d| d.name().as_deref() == Some(name))
    }

    /// First free name for a device type: `type`, `type 2`, `type 3`, ...
    pub fn assign_name(&self, device_type: &str) -> String {
        let mut name = device_type.to_string();
        let mut i = 2;
        while self.find(&name).is_some() {
            name = format!("{} {}", device_type, i);
            i += 1;
        }
        name
    }

    /// Remove the devices on a port, returning their descriptions
    pub fn remove_port(&self, port_name: &str) -> Vec<AutoDeviceInfo> {
        let mut devices = self.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = devices
            .drain(..)
            .partition(|d| d.core().port_name() == port_name);
        *devices = kept;
        removed.iter().map(|d| d.info()).collect()
    }

    /// Call `handler` with every sensor update
    pub fn add_input_handler(&self, handler: InputHandler) {
        self.input_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Pass one sensor update to every input handler
    pub fn run_input_handlers(&self, name: &str, values: &[f64]) {
        let handlers = self
            .input_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler(name, values);
        }
    }

    /// Server messages addressed to auto devices
    pub fn handle_server_message(
        &self,
        message_type: &str,
        parameters: &Value,
        send_set: impl FnOnce(&AutoDevice, String),
    ) -> HandlerOutcome {
        let param = |key: &str| parameters.get(key).and_then(Value::as_str).unwrap_or("");
        match message_type {
            "rename_device" => match self.find(param("old_name")) {
                Some(device) => {
                    device.set_name(param("new_name"));
                    HandlerOutcome::used()
                }
                None => not_found(param("old_name")),
            },
            "store_sensor" => match self.find(param("name")) {
                Some(device) => {
                    device.set_store_sequence(true);
                    HandlerOutcome::used()
                }
                None => not_found(param("name")),
            },
            "update_actuator" => {
                if let Some(device) = self.find(param("name")) {
                    let value = parameters
                        .get("value")
                        .map(crate::config::value_to_string)
                        .unwrap_or_default();
                    send_set(&device, format!("set {}", value));
                }
                HandlerOutcome::used()
            }
            _ => HandlerOutcome::unused(),
        }
    }
}

fn not_found(name: &str) -> HandlerOutcome {
    HandlerOutcome::respond(Envelope::new(
        "error",
        json!({ "message": format!("device not found: {}", name) }),
    ))
}

impl std::fmt::Debug for AutoDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoDevices")
            .field("devices", &self.lock().len())
            .finish_non_exhaustive()
    }
}
