//! MQTT publish/subscribe transport
//!
//! Connects to a broker over websockets, subscribes to the controller's own
//! folder and publishes each envelope as a single-key JSON object to the
//! envelope's folder, or to the controller's folder when it has none. Topics
//! are server paths without the leading slash.

use futures::future::BoxFuture;
use futures::{sink, stream};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;
use tokio::sync::mpsc;

use super::transport::{Connector, Link};
use super::{Envelope, TransportError, WireFormat};

/// Default broker port
pub const DEFAULT_MQTT_PORT: u16 = 443;

/// Websocket path of the broker
pub const MQTT_WEBSOCKET_PATH: &str = "/mqtt";

/// User name sent with the secret key
pub const MQTT_USER: &str = "key";

const KEEP_ALIVE: Duration = Duration::from_secs(45);
const REQUEST_CAPACITY: usize = 64;

/// Topic for a server path
pub fn topic_for_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// MQTT broker connection
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    tls: bool,
    secret_key: String,
    own_path: String,
}

impl MqttConnector {
    /// Connector for the broker at `host:port`, publishing and subscribing
    /// as the controller at `own_path`
    pub fn new(host: impl Into<String>, port: u16, secret_key: impl Into<String>, own_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            tls: true,
            secret_key: secret_key.into(),
            own_path: own_path.into(),
        }
    }

    /// Use plain websockets instead of TLS
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Broker URL, e.g. `wss://broker.example.org:443/mqtt`
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, MQTT_WEBSOCKET_PATH)
    }

    /// Topic subscribed to for incoming messages
    pub fn own_topic(&self) -> &str {
        topic_for_path(&self.own_path)
    }

    /// Topic an envelope is published to
    pub fn topic_for(&self, envelope: &Envelope) -> String {
        let path = envelope.folder.as_deref().unwrap_or(&self.own_path);
        topic_for_path(path).to_string()
    }

    /// Client options for one connection
    pub fn options(&self) -> MqttOptions {
        let client_id = format!("fieldrelay-{:08x}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, self.url(), self.port);
        options.set_credentials(MQTT_USER, self.secret_key.as_str());
        options.set_keep_alive(KEEP_ALIVE);
        if self.tls {
            options.set_transport(Transport::wss_with_default_config());
        } else {
            options.set_transport(Transport::Ws);
        }
        options
    }

    async fn open(&self) -> Result<Link, TransportError> {
        let (client, mut events) = AsyncClient::new(self.options(), REQUEST_CAPACITY);

        // the broker answers CONNECT before anything else
        loop {
            match events.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => break,
                _ => continue,
            }
        }
        tracing::info!("connected to MQTT broker/server at {}:{}", self.host, self.port);
        let topic = self.own_topic().to_string();
        client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
        tracing::info!("subscribed to {}", topic);

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(events, incoming_tx));

        let connector = self.clone();
        let sink = sink::unfold(client, move |client, envelope: Envelope| {
            let topic = connector.topic_for(&envelope);
            async move {
                client
                    .publish(topic, QoS::AtMostOnce, false, envelope.encode(WireFormat::Keyed))
                    .await?;
                Ok::<_, TransportError>(client)
            }
        });
        let stream = stream::unfold(incoming_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Link::new(sink, stream))
    }
}

/// Drive the client until the broker connection fails or the link is dropped
async fn pump_events(
    mut events: EventLoop,
    incoming: mpsc::UnboundedSender<Result<String, TransportError>>,
) {
    loop {
        tokio::select! {
            _ = incoming.closed() => break,
            event = events.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let text = String::from_utf8_lossy(&publish.payload).into_owned();
                    if incoming.send(Ok(text)).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = incoming.send(Err(e.into()));
                    break;
                }
            },
        }
    }
}

impl Connector for MqttConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Link, TransportError>> {
        Box::pin(self.open())
    }

    fn uses_message_handshake(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        self.url()
    }
}
