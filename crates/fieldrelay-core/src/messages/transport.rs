//! Server connection transports
//!
//! A [`Connector`] opens a [`Link`]: a sink of outbound envelopes and a
//! stream of inbound text messages. Each transport encodes envelopes its own
//! way; the session never sees the underlying protocol.

use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

use super::{Envelope, TransportError, WireFormat};

/// Outbound half of a connection
pub type LinkSink = Pin<Box<dyn Sink<Envelope, Error = TransportError> + Send>>;

/// Inbound half of a connection; ends or yields an error when the connection drops
pub type LinkStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An established connection
pub struct Link {
    /// Outbound messages
    pub sink: LinkSink,
    /// Inbound text messages; ends when the server closes
    pub stream: LinkStream,
}

impl Link {
    /// Box a sink and stream into a link
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Envelope, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens connections to the server
pub trait Connector: Send + Sync {
    /// Open a new connection
    fn connect(&self) -> BoxFuture<'_, Result<Link, TransportError>>;

    /// Whether the session sends its `subscribe` handshake and keep-alive
    /// pings as messages; transports with their own subscriptions and
    /// keep-alive return false
    fn uses_message_handshake(&self) -> bool {
        true
    }

    /// Human readable target for logs
    fn describe(&self) -> String;
}

/// Websocket path on the server
pub const WEBSOCKET_PATH: &str = "/api/v1/websocket";

/// Subprotocol requested during the websocket handshake
pub const WEBSOCKET_PROTOCOL: &str = "http-only";

/// Websocket connection to the server's message endpoint
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    authorization: Option<String>,
    format: WireFormat,
}

impl WebSocketConnector {
    /// Connector for `server_name` (host or host:port)
    ///
    /// Encryption is used unless disabled or the server is on localhost.
    pub fn new(server_name: &str, secure: bool) -> Self {
        Self {
            url: websocket_url(server_name, secure),
            authorization: None,
            format: WireFormat::Json,
        }
    }

    /// Write envelopes in `format` instead of JSON objects
    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    /// Send HTTP basic credentials with the handshake
    pub fn with_basic_auth(mut self, user: &str, secret: &str) -> Self {
        use base64::Engine;
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, secret));
        self.authorization = Some(format!("Basic {}", token));
        self
    }

    /// Websocket URL
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<Link, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(WEBSOCKET_PROTOCOL),
        );
        if let Some(auth) = &self.authorization {
            let value = HeaderValue::from_str(auth)
                .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws.split();

        let format = self.format;
        let sink = write.sink_map_err(TransportError::from).with(move |envelope: Envelope| {
            future::ready(Ok::<_, TransportError>(Message::text(envelope.encode(format) + "\n")))
        });

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Link::new(sink, stream))
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Link, TransportError>> {
        Box::pin(self.open())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Build the websocket URL for a server name
pub fn websocket_url(server_name: &str, secure: bool) -> String {
    let scheme = if secure && !is_local_server(server_name) {
        "wss"
    } else {
        "ws"
    };
    format!("{}://{}{}", scheme, server_name, WEBSOCKET_PATH)
}

/// Whether a server name refers to this machine
pub fn is_local_server(server_name: &str) -> bool {
    server_name.starts_with("localhost") || server_name.starts_with("127.0.0.1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("example.org", true),
            "wss://example.org/api/v1/websocket"
        );
        assert_eq!(
            websocket_url("localhost:5000", true),
            "ws://localhost:5000/api/v1/websocket"
        );
        assert_eq!(
            websocket_url("example.org", false),
            "ws://example.org/api/v1/websocket"
        );
    }

    #[test]
    fn test_basic_auth_header() {
        let connector = WebSocketConnector::new("example.org", true).with_basic_auth("0.1.0", "key");
        assert_eq!(connector.authorization.as_deref(), Some("Basic MC4xLjA6a2V5"));
    }
}
