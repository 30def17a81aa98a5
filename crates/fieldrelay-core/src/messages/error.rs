//! Server messaging errors

use thiserror::Error;

/// Errors on the server connection
#[derive(Error, Debug)]
pub enum TransportError {
    /// Server URL could not be built
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// Websocket protocol failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// MQTT client or broker failure
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Connection closed
    #[error("connection closed by server")]
    Closed,

    /// Socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        match e {
            tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed => TransportError::Closed,
            tokio_tungstenite::tungstenite::Error::Io(io) => TransportError::Io(io),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

impl From<rumqttc::ConnectionError> for TransportError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        match e {
            rumqttc::ConnectionError::Io(io) => TransportError::Io(io),
            other => TransportError::Mqtt(other.to_string()),
        }
    }
}

impl From<rumqttc::ClientError> for TransportError {
    fn from(e: rumqttc::ClientError) -> Self {
        TransportError::Mqtt(e.to_string())
    }
}

/// Errors parsing an inbound server message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Blank message
    #[error("empty message")]
    Empty,

    /// Malformed JSON
    #[error("invalid JSON: {0}")]
    Json(String),

    /// JSON object without a message type
    #[error("message has no type")]
    MissingType,
}
