//! Serial port discovery
//!
//! Enumerates serial ports and opens them for async use.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{SerialError, DEFAULT_BAUD_RATE};

/// Device name prefixes of USB serial adapters under `/dev`
const USB_PREFIXES: [&str; 2] = ["ttyUSB", "ttyACM"];

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key so that ttyACM* ports come first, then ttyUSB*, then everything
/// else; numeric suffixes sort numerically.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in ["ttyACM", "ttyUSB"].iter().enumerate() {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank as u8, num, basename.to_string());
        }
    }
    (2, 0, basename.to_string())
}

/// Returns true for `/dev` entries that look like USB serial adapters
pub fn is_usb_serial_name(file_name: &str) -> bool {
    USB_PREFIXES.iter().any(|p| file_name.starts_with(p))
}

/// List USB serial device names (e.g. `ttyUSB0`) present in a device directory.
///
/// A missing or unreadable directory yields an empty list.
pub fn scan_usb_names(dev_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dev_dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| is_usb_serial_name(name))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort_by_key(|n| port_sort_key(n));
    names
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // The serialport API misses some CDC devices; fill in from /dev
    for name in scan_usb_names(Path::new("/dev")) {
        let full = format!("/dev/{}", name);
        map.entry(full.clone())
            .or_insert_with(|| PortInfo::bare(full));
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port for async I/O (8N1, no flow control)
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<SerialStream, SerialError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let stream = tokio_serial::new(name, baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(Duration::from_millis(50))
        .open_native_async()?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // Only checks that enumeration does not panic on this host
        for port in list_ports() {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let mut names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        names.sort_by_key(|n| port_sort_key(n));

        assert_eq!(
            names,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_scan_usb_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB0", "ttyACM0", "tty0", "null"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(scan_usb_names(dir.path()), vec!["ttyACM0", "ttyUSB0"]);
    }

    #[test]
    fn test_scan_missing_dir() {
        assert!(scan_usb_names(Path::new("/nonexistent/dev")).is_empty());
    }
}
