//! Serial bus communication
//!
//! Line-oriented ASCII protocol spoken by the field devices:
//! `<deviceId>:<command>|<crc>\n`, with a CRC-16 checksum on every line.

pub mod checksum;
pub mod discovery;
mod error;
pub mod frame;
mod port;

pub use discovery::{list_ports, open_port, scan_usb_names, PortInfo};
pub use error::{FrameError, SerialError};
pub use port::{PortGuard, SerialPort};

/// Default baud rate of device firmware
pub const DEFAULT_BAUD_RATE: u32 = 9600;
