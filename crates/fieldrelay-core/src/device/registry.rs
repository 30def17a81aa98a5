//! Devices and ports known to the controller
//!
//! Owns the open serial ports, a listener task per port, the device map
//! keyed by (port, id), the polling loop and the serial error counter.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::auto::AutoDevices;
use super::protocol::{self, CommandOptions};
use super::{Device, DeviceContext, DeviceError, DeviceMessage};
use crate::config::{value_to_string, Config, SharedConfig};
use crate::messages::{HandlerOutcome, MessageHandler, OutboundQueue};
use crate::sequences::SequenceClient;
use crate::serial::frame::{self, BROADCAST_ID};
use crate::serial::{SerialError, SerialPort};

/// Port name used for devices added while no port is open
pub const SIMULATED_PORT: &str = "sim";

/// Interval of the serial error report
pub const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(60);

/// Auto devices without a type are asked for info this often
pub const CHECK_DEVICES_INTERVAL: Duration = Duration::from_secs(10);

const IDLE_POLL_SLEEP: Duration = Duration::from_millis(100);
const READ_RETRY_SLEEP: Duration = Duration::from_millis(10);

/// User callback for serial messages: `(device_id, command, args) -> used`
pub type SerialHandler = Arc<dyn Fn(&str, &str, &[String]) -> bool + Send + Sync>;

type DeviceKey = (String, String);

struct PortEntry {
    port: Arc<SerialPort>,
    listener: JoinHandle<()>,
}

/// Registry of serial ports and the devices on them
pub struct DeviceRegistry {
    me: Weak<DeviceRegistry>,
    config: SharedConfig,
    queue: Arc<OutboundQueue>,
    sequences: Arc<SequenceClient>,
    ports: Mutex<Vec<PortEntry>>,
    devices: Mutex<BTreeMap<DeviceKey, Arc<dyn Device>>>,
    auto_devices: AutoDevices,
    serial_handlers: RwLock<Vec<SerialHandler>>,
    error_count: AtomicU64,
    send_serial_to_server: AtomicBool,
    fast_polling: Mutex<Option<Vec<String>>>,
    cancel: CancellationToken,
}

impl DeviceRegistry {
    /// Registry with no ports; background tasks stop when `cancel` fires
    pub fn new(
        config: SharedConfig,
        queue: Arc<OutboundQueue>,
        sequences: Arc<SequenceClient>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            queue,
            sequences,
            ports: Mutex::new(Vec::new()),
            devices: Mutex::new(BTreeMap::new()),
            auto_devices: AutoDevices::new(),
            serial_handlers: RwLock::new(Vec::new()),
            error_count: AtomicU64::new(0),
            send_serial_to_server: AtomicBool::new(false),
            fast_polling: Mutex::new(None),
            cancel,
        })
    }

    /// Queue used for device reports
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Sequence client used by device handlers
    pub fn sequences(&self) -> &Arc<SequenceClient> {
        &self.sequences
    }

    /// Auto-detected devices
    pub fn auto_devices(&self) -> &AutoDevices {
        &self.auto_devices
    }

    fn with_config<T>(&self, f: impl FnOnce(&Config) -> T) -> T {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        f(&config)
    }

    fn command_options(&self) -> CommandOptions {
        self.with_config(CommandOptions::from_config)
    }

    fn lock_ports(&self) -> std::sync::MutexGuard<'_, Vec<PortEntry>> {
        self.ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, BTreeMap<DeviceKey, Arc<dyn Device>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ======== ports ========

    /// Open a physical port and start listening on it; failures are logged
    pub fn open_port(&self, name: &str, baud_rate: Option<u32>) -> bool {
        let opened = if self.port(Some(name)).is_some() {
            Err(SerialError::AlreadyOpen(name.to_string()))
        } else {
            SerialPort::open(name, baud_rate).and_then(|port| self.attach_port(port))
        };
        match opened {
            Ok(_) => {
                tracing::info!("connected to {}", name);
                true
            }
            Err(e) => {
                tracing::warn!("unable to connect to {}: {}", name, e);
                false
            }
        }
    }

    /// Register an open port and spawn its listener; a second port with
    /// the same name is refused
    pub fn attach_port(&self, port: SerialPort) -> Result<Arc<SerialPort>, SerialError> {
        let mut ports = self.lock_ports();
        if ports.iter().any(|p| p.port.name() == port.name()) {
            return Err(SerialError::AlreadyOpen(port.name().to_string()));
        }
        let port = Arc::new(port);
        let listener = match self.me.upgrade() {
            Some(registry) => tokio::spawn(registry.listen(port.clone())),
            None => tokio::spawn(async {}),
        };
        ports.push(PortEntry {
            port: port.clone(),
            listener,
        });
        Ok(port)
    }

    /// Close a port and remove the devices on it
    pub async fn close_port(&self, name: &str) -> bool {
        let entry = {
            let mut ports = self.lock_ports();
            match ports.iter().position(|p| p.port.name() == name) {
                Some(pos) => ports.remove(pos),
                None => return false,
            }
        };
        entry.listener.abort();
        entry.port.close().await;
        self.lock_devices().retain(|(port, _), _| port != name);
        tracing::info!("closed {}", name);
        true
    }

    /// A port by name, or the first open port
    pub fn port(&self, name: Option<&str>) -> Option<Arc<SerialPort>> {
        let ports = self.lock_ports();
        match name {
            Some(name) => ports.iter().find(|p| p.port.name() == name),
            None => ports.first(),
        }
        .map(|p| p.port.clone())
    }

    /// Names of the open ports, in open order
    pub fn port_names(&self) -> Vec<String> {
        self.lock_ports()
            .iter()
            .map(|p| p.port.name().to_string())
            .collect()
    }

    /// Whether at least one port is open
    pub fn is_connected(&self) -> bool {
        !self.lock_ports().is_empty()
    }

    fn default_port_name(&self) -> String {
        self.lock_ports()
            .first()
            .map(|p| p.port.name().to_string())
            .unwrap_or_else(|| SIMULATED_PORT.to_string())
    }

    // ======== devices ========

    /// Add a device without contacting it; false if the id is taken on that port
    pub fn register_device(&self, device: Arc<dyn Device>) -> bool {
        let key = (
            device.core().port_name().to_string(),
            device.core().id().to_string(),
        );
        let mut devices = self.lock_devices();
        if devices.contains_key(&key) {
            tracing::warn!("device '{}' on port '{}' is already defined", key.1, key.0);
            return false;
        }
        devices.insert(key, device);
        true
    }

    /// Add a device and enable checksums on it
    pub async fn add_device(&self, device: Arc<dyn Device>) {
        if self.register_device(device.clone()) {
            if let Err(e) = self.send_to_device(device.as_ref(), "checksum 1").await {
                tracing::warn!("unable to enable checksum: {}", e);
            }
        }
    }

    /// Deregister a device
    pub fn remove_device(&self, port_name: &str, device_id: &str) -> Option<Arc<dyn Device>> {
        self.lock_devices()
            .remove(&(port_name.to_string(), device_id.to_string()))
    }

    /// Device by port and id
    pub fn device(&self, port_name: &str, device_id: &str) -> Option<Arc<dyn Device>> {
        self.lock_devices()
            .get(&(port_name.to_string(), device_id.to_string()))
            .cloned()
    }

    /// A device on the first port (or the simulated port)
    pub fn find_device(&self, device_id: &str) -> Option<Arc<dyn Device>> {
        self.device(&self.default_port_name(), device_id)
    }

    /// Every registered device
    pub fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.lock_devices().values().cloned().collect()
    }

    /// Devices on one port
    pub fn devices_on_port(&self, port_name: &str) -> Vec<Arc<dyn Device>> {
        self.lock_devices()
            .iter()
            .filter(|((port, _), _)| port == port_name)
            .map(|(_, d)| d.clone())
            .collect()
    }

    // ======== commands ========

    /// Send a command to a device on its own port and wait for the ack
    pub async fn send_to_device(&self, device: &dyn Device, command: &str) -> Result<(), DeviceError> {
        let core = device.core();
        match self.port(Some(core.port_name())) {
            Some(port) => protocol::send_command(&port, core, command, &self.command_options()).await,
            None if !self.is_connected() => {
                tracing::debug!("[sim] {}: {}", core.id(), command);
                Ok(())
            }
            None => Err(DeviceError::PortNotFound(core.port_name().to_string())),
        }
    }

    /// Send a command by device id on the first port; `*` broadcasts on every port
    pub async fn send_command(&self, device_id: &str, command: &str) -> Result<(), DeviceError> {
        if device_id == BROADCAST_ID {
            tracing::debug!("sending broadcast command {}", command);
            let ports: Vec<Arc<SerialPort>> = self.lock_ports().iter().map(|p| p.port.clone()).collect();
            let message = format!("{}:{}", BROADCAST_ID, command);
            for port in ports {
                port.write_command(&message).await;
            }
            return Ok(());
        }
        match self.find_device(device_id) {
            Some(device) => self.send_to_device(device.as_ref(), command).await,
            None => {
                tracing::warn!("send_command to unrecognized device ({})", device_id);
                Err(DeviceError::NotFound(device_id.to_string()))
            }
        }
    }

    /// Send commands to a device in the background, in order; failures are logged
    pub fn spawn_commands(&self, port_name: &str, device_id: &str, commands: &[&str]) {
        let Some(registry) = self.me.upgrade() else {
            return;
        };
        let port_name = port_name.to_string();
        let device_id = device_id.to_string();
        let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        tokio::spawn(async move {
            let Some(device) = registry.device(&port_name, &device_id) else {
                tracing::warn!("device not found: [{}, {}]", port_name, device_id);
                return;
            };
            for command in commands {
                if let Err(e) = registry.send_to_device(device.as_ref(), &command).await {
                    tracing::warn!("{}", e);
                    return;
                }
            }
        });
    }

    // ======== inbound frames ========

    /// Add a callback offered every serial message not used by its device
    pub fn add_serial_handler(&self, handler: SerialHandler) {
        self.serial_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Forward verified frames to the server as `serialMessage`
    pub fn set_send_serial_to_server(&self, enabled: bool) {
        self.send_serial_to_server.store(enabled, Ordering::Relaxed);
    }

    /// Serial errors counted since the last diagnostic report
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    fn count_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Verify and route one received line
    pub fn process_frame(&self, port_name: &str, line: &str) {
        let body = match frame::decode(line) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("{}: [{}]", e, frame::sanitize(line));
                self.count_error();
                if let Some(port) = self.port(Some(port_name)) {
                    port.set_checksum_error();
                }
                return;
            }
        };

        let quiet = self.with_config(|c| c.get_bool("serial.quiet_polling", true));
        if !(quiet && body.ends_with("ack q")) {
            tracing::debug!("    {}", body);
        }
        if self.send_serial_to_server.load(Ordering::Relaxed) {
            self.queue
                .send("serialMessage", json!({ "message": frame::sanitize(body) }));
        }

        let (device_id, payload) = match frame::split_device_id(body) {
            (Some(id), payload) => (id.to_string(), payload),
            (None, payload) => match self.sole_device_id(port_name) {
                Some(id) => (id, payload),
                None => {
                    tracing::warn!("serial message ({}) without device ID", frame::sanitize(payload));
                    self.count_error();
                    return;
                }
            },
        };
        let Some(message) = DeviceMessage::parse(payload) else {
            return;
        };

        let mut used = match self.device(port_name, &device_id) {
            Some(device) => device.handle_message(&message, &DeviceContext { registry: self }),
            None => {
                tracing::warn!("device not found: [{}, {}, {}]", port_name, device_id, message.text);
                false
            }
        };

        let handlers = self
            .serial_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            if used {
                break;
            }
            used = handler(&device_id, &message.command, &message.args);
        }
        if !used {
            tracing::debug!("unrecognized message received from serial");
        }
    }

    /// The only device on a port; `None` when there are zero or several
    fn sole_device_id(&self, port_name: &str) -> Option<String> {
        let devices = self.lock_devices();
        let mut on_port = devices.keys().filter(|(port, _)| port == port_name);
        match (on_port.next(), on_port.next()) {
            (Some((_, id)), None) => Some(id.clone()),
            _ => None,
        }
    }

    async fn listen(self: Arc<Self>, port: Arc<SerialPort>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = port.read_message() => match line {
                    Some(line) if !line.is_empty() => self.process_frame(port.name(), &line),
                    Some(_) => {}
                    None => sleep(READ_RETRY_SLEEP).await,
                },
            }
        }
    }

    // ======== polling ========

    /// Restrict polling to these device ids on the first port; `None` or empty polls all
    pub fn set_fast_polling(&self, device_ids: Option<Vec<String>>) {
        *self.fast_polling.lock().unwrap_or_else(|e| e.into_inner()) =
            device_ids.filter(|ids| !ids.is_empty());
    }

    fn poll_targets(&self) -> (Vec<Arc<dyn Device>>, bool) {
        let fast = self
            .fast_polling
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let devices: Vec<Arc<dyn Device>> = match &fast {
            Some(ids) => {
                let port = self.default_port_name();
                ids.iter().filter_map(|id| self.device(&port, id)).collect()
            }
            None => self.devices(),
        };
        let targets = devices
            .into_iter()
            .filter(|d| d.core().polling_enabled())
            .collect();
        (targets, fast.is_some())
    }

    /// Pause after each batch of polls
    pub fn poll_delay(&self, device_count: usize, fast: bool) -> Duration {
        let configured = self
            .with_config(|c| c.get_f64("serial.poll_sleep"))
            .filter(|s| *s > 0.0);
        if let Some(seconds) = configured {
            return Duration::from_secs_f64(seconds);
        }
        if fast {
            return Duration::from_millis(100);
        }
        match device_count {
            1 => Duration::from_millis(400),
            2 => Duration::from_millis(300),
            _ => Duration::from_millis(200),
        }
    }

    /// Poll every target once, pausing after each batch of three and after
    /// the last; returns the number polled
    pub async fn poll_cycle(&self) -> usize {
        let (targets, fast) = self.poll_targets();
        if targets.is_empty() {
            sleep(IDLE_POLL_SLEEP).await;
            return 0;
        }
        let delay = self.poll_delay(targets.len(), fast);

        for (index, device) in targets.iter().enumerate() {
            if let Err(e) = self.send_to_device(device.as_ref(), "q").await {
                tracing::debug!("poll failed: {}", e);
            }
            let polled = index + 1;
            if polled % 3 == 0 || polled == targets.len() {
                sleep(delay).await;
            }
        }
        targets.len()
    }

    async fn poll_loop(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.poll_cycle() => {}
            }
        }
    }

    async fn diagnostic_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(DIAGNOSTIC_INTERVAL) => {}
            }
            let report = self.with_config(|c| {
                c.get_bool("enable_server", true) && c.get_bool("enable_diagnostic_sequences", false)
            });
            let count = self.error_count.swap(0, Ordering::Relaxed);
            if report {
                self.sequences.update("serial_errors", count);
            }
        }
    }

    /// Ask auto devices that have not reported a type for their info
    pub async fn check_devices(&self) {
        for device in self.auto_devices.without_type() {
            if let Err(e) = self.send_to_device(device.as_ref(), "info").await {
                tracing::debug!("{}", e);
            }
        }
    }

    async fn check_devices_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(CHECK_DEVICES_INTERVAL) => {}
            }
            self.check_devices().await;
        }
    }

    /// Start the diagnostic task, plus polling and auto device checks when enabled
    pub fn spawn_tasks(self: &Arc<Self>, polling: bool, auto_devices: bool) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(self.clone().diagnostic_loop())];
        if polling {
            tasks.push(tokio::spawn(self.clone().poll_loop()));
        }
        if auto_devices {
            tasks.push(tokio::spawn(self.clone().check_devices_loop()));
        }
        tasks
    }

    /// Drop the auto devices of a removed port and tell the server
    pub fn remove_auto_devices(&self, port_name: &str) {
        for info in self.auto_devices.remove_port(port_name) {
            self.queue.send("device_removed", info.to_value());
        }
    }

    /// Stop listeners
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.lock_ports().iter() {
            entry.listener.abort();
        }
    }
}

impl MessageHandler for DeviceRegistry {
    fn handle_message(&self, message_type: &str, parameters: &Value) -> HandlerOutcome {
        match message_type {
            "serial_command" | "serialCommand" => {
                let command = parameters
                    .get("command")
                    .map(value_to_string)
                    .unwrap_or_default();
                match self.port(None) {
                    Some(port) => {
                        tracing::info!("sending command from server: {}", command);
                        tokio::spawn(async move { port.write_command(&command).await });
                    }
                    None => tracing::info!("no serial connection for command from server: {}", command),
                }
                HandlerOutcome::used()
            }
            "send_serial" | "sendSerial" => {
                let enabled = match parameters.get("enable") {
                    Some(Value::Bool(b)) => *b,
                    Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
                    Some(Value::String(s)) => s.trim().parse::<i64>().unwrap_or(0) != 0,
                    _ => false,
                };
                self.set_send_serial_to_server(enabled);
                HandlerOutcome::used()
            }
            _ => self
                .auto_devices
                .handle_server_message(message_type, parameters, |device, command| {
                    self.spawn_commands(device.core().port_name(), device.core().id(), &[&command]);
                }),
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("ports", &self.port_names())
            .field("devices", &self.lock_devices().len())
            .field("error_count", &self.error_count())
            .finish_non_exhaustive()
    }
}
