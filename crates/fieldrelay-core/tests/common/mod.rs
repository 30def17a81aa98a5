//! Shared fixtures: simulated serial devices, an in-memory server link and
//! a one-shot HTTP responder.

#![allow(dead_code)]

use fieldrelay_core::config::Config;
use fieldrelay_core::device::DeviceRegistry;
use fieldrelay_core::messages::{
    Connector, Envelope, Link, OutboundQueue, TransportError, WireFormat,
};
use fieldrelay_core::resources::ResourceClient;
use fieldrelay_core::sequences::SequenceClient;
use fieldrelay_core::serial::frame;
use fieldrelay_core::serial::SerialPort;
use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::SinkExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Registry with an in-memory queue and no server
pub fn registry_with(config: Value) -> (Arc<DeviceRegistry>, Arc<OutboundQueue>) {
    let config = Config::from_value(config).unwrap().into_shared();
    let queue = Arc::new(OutboundQueue::new());
    let resources = Arc::new(ResourceClient::new("localhost", false, "test"));
    let sequences = Arc::new(SequenceClient::new(config.clone(), queue.clone(), resources));
    let registry = DeviceRegistry::new(config, queue.clone(), sequences, CancellationToken::new());
    (registry, queue)
}

/// Attach a simulated port; returns the device end of the line
pub fn attach_sim_port(registry: &DeviceRegistry, name: &str) -> DuplexStream {
    let (host, device) = duplex(4096);
    let (r, w) = tokio::io::split(host);
    registry.attach_port(SerialPort::new(name, r, w)).unwrap();
    device
}

/// Write one checksummed frame from the device side
pub async fn device_send(device: &mut DuplexStream, body: &str) {
    let line = format!("{}\n", frame::encode(body));
    device.write_all(line.as_bytes()).await.unwrap();
}

/// Acknowledge every command received, as device firmware does
pub fn spawn_echo_device(device: DuplexStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (r, mut w) = tokio::io::split(device);
        let mut lines = BufReader::new(r).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(body) = frame::decode(&line) else {
                continue;
            };
            let (Some(id), command) = frame::split_device_id(body) else {
                continue;
            };
            if id == frame::BROADCAST_ID {
                continue;
            }
            let reply = format!("{}\n", frame::encode(&format!("{}:ack {}", id, command)));
            if w.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    })
}

/// Server side of one in-memory connection
pub struct ServerEnd {
    /// Messages sent by the session, as JSON text
    pub received: mpsc::UnboundedReceiver<String>,
    /// Messages to deliver to the session; dropping it closes the connection
    pub outgoing: mpsc::UnboundedSender<Result<String, TransportError>>,
}

/// Connector handing each new connection to the test
pub struct ChannelConnector {
    connections: tokio::sync::mpsc::UnboundedSender<ServerEnd>,
}

impl ChannelConnector {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ServerEnd>) {
        let (connections, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { connections }, rx)
    }
}

impl Connector for ChannelConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Link, TransportError>> {
        let (to_server, received) = mpsc::unbounded::<String>();
        let (outgoing, from_server) = mpsc::unbounded::<Result<String, TransportError>>();
        let accepted = self.connections.send(ServerEnd { received, outgoing }).is_ok();
        Box::pin(async move {
            if !accepted {
                return Err(TransportError::Closed);
            }
            let sink = to_server
                .sink_map_err(|_| TransportError::Closed)
                .with(|envelope: Envelope| {
                    future::ready(Ok::<_, TransportError>(envelope.encode(WireFormat::Json)))
                });
            Ok(Link::new(sink, from_server))
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Serve one canned HTTP response per accepted connection, in order.
///
/// Returns the base address and a receiver of the request heads.
pub async fn http_responder(
    responses: Vec<(u16, &'static str)>,
) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (requests, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let _ = requests.send(String::from_utf8_lossy(&buf[..n]).into_owned());
            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (address, rx)
}
