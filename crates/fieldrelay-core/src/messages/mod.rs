//! Server messaging
//!
//! Envelopes, the outbound queue, transports and the reconnecting session
//! that carries messages between the controller and the server.

mod auth;
mod envelope;
mod error;
pub mod mqtt;
mod queue;
mod router;
mod session;
pub mod transport;

pub use auth::{auth_code_with_nonce, build_auth_code, Handshake, LegacyAuth};
pub use envelope::{Envelope, OutboundMessage, WireFormat};
pub use error::{ParseError, TransportError};
pub use queue::{DrainOutcome, OutboundQueue, DEFAULT_MAX_AGE_SECS};
pub use router::{HandlerOutcome, MessageHandler, MessageRouter};
pub use session::{SessionConfig, SessionState, TransportSession};
pub use mqtt::MqttConnector;
pub use transport::{Connector, Link, LinkSink, LinkStream, WebSocketConnector};
