//! # FieldRelay Core Library
//!
//! Core functionality for the FieldRelay controller client.
//!
//! This library provides:
//! - Checksummed line framing for the serial device bus
//! - Command/acknowledgement exchanges with field devices
//! - A device registry with polling, auto-detected devices and USB hot-plug
//! - A reliable outbound message queue and a reconnecting server session
//! - The server resource API (files, sequences, provisioning)
//! - Websocket and MQTT server transports
//! - Periodic processor and disk usage reports
//! - Log forwarding to the server and size-bounded log files
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldrelay_core::prelude::*;
//!
//! let config = Config::load("config.json")?;
//! let controller = Controller::new(config);
//! controller.sequences().update("temperature", 21.5);
//! controller.run().await?;
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod controller;
pub mod device;
pub mod logging;
pub mod messages;
pub mod monitor;
pub mod resources;
pub mod sequences;
pub mod serial;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, ConfigError, SharedConfig};
    pub use crate::controller::{Controller, ControllerError};
    pub use crate::device::{
        AutoDevice, AutoDevices, BasicDevice, Device, DeviceCore, DeviceError, DeviceRegistry,
    };
    pub use crate::logging::{ServerLogHandle, ServerLogLayer};
    pub use crate::messages::{
        Envelope, HandlerOutcome, MessageHandler, OutboundQueue, SessionState, TransportSession,
    };
    pub use crate::resources::{ApiError, ResourceClient};
    pub use crate::sequences::{DataType, SequenceClient};
    pub use crate::serial::{FrameError, SerialError, SerialPort};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
