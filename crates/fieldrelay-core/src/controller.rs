//! Controller runtime
//!
//! Builds every component from one [`Config`], provisions a secret key when
//! needed, connects to the server and runs the serial tasks until shutdown.
//!
//! ```rust,ignore
//! let config = Config::load("config.json")?;
//! let controller = Controller::new(config);
//! controller.registry().add_serial_handler(Arc::new(|id, cmd, args| { ... }));
//! controller.run().await?;
//! ```

use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{redact, Config, ConfigError, SharedConfig};
use crate::device::{DeviceError, DeviceRegistry, UsbWatcher};
use crate::messages::mqtt::DEFAULT_MQTT_PORT;
use crate::messages::{
    Connector, Handshake, LegacyAuth, MessageHandler, MessageRouter, MqttConnector,
    OutboundQueue, SessionConfig, TransportError, TransportSession, WebSocketConnector,
    WireFormat,
};
use crate::monitor::SystemMonitor;
use crate::resources::{ApiError, ResourceClient};
use crate::sequences::SequenceClient;
use crate::serial::SerialError;

/// Build reference, set at compile time
pub const BUILD: &str = match option_env!("FIELDRELAY_BUILD") {
    Some(build) => build,
    None => "unknown",
};

/// Time between PIN checks during provisioning
pub const PIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Provisioning gives up after this long
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval of the "waiting for connection" log
const CONNECT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Callback run by [`Controller::error`]
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors that stop the controller
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Resource API failure
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Server connection failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Serial port failure
    #[error(transparent)]
    Serial(#[from] SerialError),

    /// Device command failure
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// PIN provisioning gave up
    #[error("no PIN entered within {0:?}")]
    ProvisioningTimeout(Duration),

    /// A required config value is missing
    #[error("missing config value: {0}")]
    MissingConfig(String),

    /// Shutdown was requested
    #[error("controller shut down")]
    Cancelled,
}

/// User name sent with server credentials: `<version>.<build>`
pub fn user_name() -> String {
    format!("{}.{}", crate::VERSION, BUILD)
}

/// Session settings from config
pub fn session_config(config: &Config) -> SessionConfig {
    let defaults = SessionConfig::default();
    let old_auth = config.get_bool("old_auth", false).then(|| LegacyAuth {
        secret_key: config.get_str("secret_key").unwrap_or_default().to_string(),
        version: format!("{}:{}", crate::VERSION, BUILD),
        name: config.get_str("name").map(str::to_string),
    });
    let reconnect = config
        .get_f64("reconnect_seconds")
        .filter(|s| *s > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(defaults.reconnect_delay);
    SessionConfig {
        reconnect_delay: reconnect,
        receive_backoff: reconnect,
        send_interval: config
            .get_u64("send_poll_ms")
            .map(Duration::from_millis)
            .unwrap_or(defaults.send_interval),
        keep_alive_interval: config
            .get_u64("keep_alive_seconds")
            .map(Duration::from_secs)
            .unwrap_or(defaults.keep_alive_interval),
        handshake: Handshake {
            subscribe_children: config.get_bool("subscribe_children", false),
            old_auth,
        },
    }
}

/// The controller and its components
pub struct Controller {
    config: SharedConfig,
    cancel: CancellationToken,
    queue: Arc<OutboundQueue>,
    resources: Arc<ResourceClient>,
    sequences: Arc<SequenceClient>,
    router: Arc<MessageRouter>,
    registry: Arc<DeviceRegistry>,
    connector: Mutex<Option<Arc<dyn Connector>>>,
    session: Mutex<Option<Arc<TransportSession>>>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
}

impl Controller {
    /// Build a controller from loaded config; nothing runs until [`Controller::start`]
    pub fn new(config: Config) -> Self {
        for (key, value) in config.display_entries() {
            tracing::debug!("{}: {}", key, value);
        }
        let resources = Arc::new(ResourceClient::from_config(&config, user_name()));
        let config = config.into_shared();
        let cancel = CancellationToken::new();
        let queue = Arc::new(OutboundQueue::new());
        let sequences = Arc::new(SequenceClient::new(
            config.clone(),
            queue.clone(),
            resources.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            config.clone(),
            queue.clone(),
            cancel.clone(),
        ));
        let registry = DeviceRegistry::new(
            config.clone(),
            queue.clone(),
            sequences.clone(),
            cancel.child_token(),
        );
        router.add_handler(registry.clone());

        Self {
            config,
            cancel,
            queue,
            resources,
            sequences,
            router,
            registry,
            connector: Mutex::new(None),
            session: Mutex::new(None),
            error_handlers: RwLock::new(Vec::new()),
        }
    }

    /// Use this connector instead of the one described by config
    pub fn with_connector(self, connector: Arc<dyn Connector>) -> Self {
        *self.connector.lock().unwrap_or_else(|e| e.into_inner()) = Some(connector);
        self
    }

    /// Live configuration
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Outbound message queue
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Resource API client
    pub fn resources(&self) -> &Arc<ResourceClient> {
        &self.resources
    }

    /// Sequence updates
    pub fn sequences(&self) -> &Arc<SequenceClient> {
        &self.sequences
    }

    /// Inbound message router
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Serial ports and devices
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The server session, once started
    pub fn session(&self) -> Option<Arc<TransportSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Token cancelled on shutdown
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handler for server messages nothing else used
    pub fn set_fallback_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.router.set_fallback(handler);
    }

    fn with_config<T>(&self, f: impl FnOnce(&Config) -> T) -> T {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        f(&config)
    }

    /// The configured server transport: MQTT when `mqtt_host` is set,
    /// otherwise the websocket endpoint of `server_name`
    async fn connector(&self) -> Result<Arc<dyn Connector>, ControllerError> {
        if let Some(connector) = self.connector.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(connector);
        }
        let mqtt = self.with_config(|c| {
            c.get_str("mqtt_host").filter(|h| !h.is_empty()).map(|host| {
                (
                    host.to_string(),
                    c.get_u64("mqtt_port")
                        .and_then(|p| u16::try_from(p).ok())
                        .unwrap_or(DEFAULT_MQTT_PORT),
                    c.get_bool("mqtt_tls", true),
                    c.get_str("secret_key").unwrap_or_default().to_string(),
                )
            })
        });
        if let Some((host, port, tls, secret_key)) = mqtt {
            let own_path = self.path_on_server().await?;
            return Ok(Arc::new(
                MqttConnector::new(host, port, secret_key, own_path).with_tls(tls),
            ));
        }

        self.with_config(|config| -> Result<Arc<dyn Connector>, ControllerError> {
            let server_name = config
                .get_str("server_name")
                .ok_or_else(|| ControllerError::MissingConfig("server_name".into()))?;
            let mut ws = WebSocketConnector::new(server_name, config.get_bool("secure_server", true));
            if config.get_str("wire_format") == Some("compact") {
                ws = ws.with_format(WireFormat::Compact);
            }
            if !config.get_bool("old_auth", false) {
                let secret = config.get_str("secret_key").unwrap_or_default();
                ws = ws.with_basic_auth(&user_name(), secret);
            }
            Ok(Arc::new(ws))
        })
    }

    /// Start everything and wait for the first server connection
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, ControllerError> {
        tracing::info!("FieldRelay client v{}", crate::VERSION);
        let mut tasks = Vec::new();

        if self.with_config(|c| c.get_bool("enable_server", true)) {
            let has_key = self.with_config(|c| c.get_str("secret_key").is_some_and(|k| !k.is_empty()));
            if !has_key {
                self.provision().await?;
            }
            let session = TransportSession::new(
                self.connector().await?,
                self.queue.clone(),
                self.router.clone(),
                self.with_config(session_config),
            );
            tasks.extend(session.spawn(self.cancel.clone()));
            *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
            self.wait_for_connection(&session).await;

            let monitor = SystemMonitor::new();
            tasks.push(tokio::spawn(monitor.run(
                self.resources.clone(),
                self.sequences.clone(),
                self.cancel.clone(),
            )));
        }

        let (port, baud_rate, sleep_seconds, polling, auto_devices) = self.with_config(|c| {
            let port = c
                .get_bool("serial.enable", c.contains("serial.port"))
                .then(|| c.get_str("serial.port").map(str::to_string))
                .flatten()
                .filter(|p| !p.is_empty());
            (
                port,
                c.get_u64("serial.baud_rate").and_then(|b| u32::try_from(b).ok()),
                c.get_f64("serial.sleep_seconds").unwrap_or(3.0),
                c.get_bool("serial.polling", false),
                c.get_bool("auto_devices", false),
            )
        });
        if let Some(port) = port {
            if self.registry.open_port(&port, baud_rate) && sleep_seconds > 0.0 {
                // devices reset when the port opens
                sleep(Duration::from_secs_f64(sleep_seconds)).await;
            }
        }

        tasks.extend(self.registry.spawn_tasks(polling, auto_devices));
        if auto_devices {
            let watcher = UsbWatcher::new(self.registry.clone(), baud_rate);
            tasks.push(tokio::spawn(watcher.run(self.cancel.clone())));
        }
        Ok(tasks)
    }

    /// Run until [`Controller::shutdown`] or a `shutdown` message from the server
    pub async fn run(&self) -> Result<(), ControllerError> {
        let tasks = self.start().await?;
        self.cancel.cancelled().await;
        self.registry.shutdown();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("controller stopped");
        Ok(())
    }

    /// Stop every task started by [`Controller::start`]
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn wait_for_connection(&self, session: &TransportSession) {
        let started = Instant::now();
        let connected = session.wait_connected();
        tokio::pin!(connected);
        loop {
            tokio::select! {
                _ = &mut connected => break,
                _ = self.cancel.cancelled() => return,
                _ = sleep(CONNECT_PROGRESS_INTERVAL) => {
                    tracing::info!(
                        "waiting for connection to message server ({} s)",
                        started.elapsed().as_secs()
                    );
                }
            }
        }
        tracing::info!("connected to message server");
    }

    /// Obtain a secret key by PIN
    async fn provision(&self) -> Result<(), ControllerError> {
        let pin = self.resources.request_pin().await?;
        tracing::info!("your PIN is: {}", pin.pin);
        tracing::info!("waiting for PIN to be entered on server");

        let deadline = Instant::now() + PROVISIONING_TIMEOUT;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ControllerError::Cancelled),
                _ = sleep(PIN_POLL_INTERVAL) => {}
            }
            if let Some(key) = self.resources.check_pin(&pin).await? {
                self.store_secret_key(&key.secret_key)?;
                self.resources.set_secret_key(&key.secret_key);
                self.resources.set_own_path(&key.controller_path);
                tracing::info!(
                    "received key {} for controller {}",
                    redact(&key.secret_key),
                    key.controller_path
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ControllerError::ProvisioningTimeout(PROVISIONING_TIMEOUT));
            }
        }
    }

    fn store_secret_key(&self, secret_key: &str) -> Result<(), ConfigError> {
        let mut entries = Map::new();
        entries.insert("secret_key".into(), Value::String(secret_key.to_string()));
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        match config.save_local(&entries) {
            Err(ConfigError::NoSourceFile) => {
                config.merge(&entries);
                Ok(())
            }
            other => other,
        }
    }

    /// Add a callback run on every [`Controller::error`]
    pub fn add_error_handler(&self, handler: ErrorHandler) {
        self.error_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Report an error: handlers, log, then email/text the error recipients
    pub fn error(&self, message: &str) {
        let handlers = self
            .error_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler(message);
        }
        tracing::error!("{}", message);

        let (recipients, subject, mut body) = self.with_config(|c| {
            (
                c.get_list("error_recipients"),
                c.get_str("error_subject").unwrap_or("system error").to_string(),
                c.get_str("error_body").unwrap_or_default().trim().to_string(),
            )
        });
        if !body.is_empty() {
            body.push(' ');
        }
        body.push_str(message);
        for recipient in recipients {
            if recipient.contains('@') {
                self.queue.send_email(&recipient, &subject, &body);
            } else {
                self.queue.send_sms(&recipient, &format!("{}: {}", subject, body));
            }
        }
    }

    /// Path of this controller's folder on the server (cached)
    pub async fn path_on_server(&self) -> Result<String, ControllerError> {
        Ok(self.resources.own_path().await?)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("registry", &self.registry)
            .field("queue_len", &self.queue.len())
            .finish_non_exhaustive()
    }
}
