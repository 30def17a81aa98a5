//! USB serial hot-plug
//!
//! Scans the device directory once a second. New adapters are opened and
//! asked for their device list; removed adapters are closed and their auto
//! devices reported to the server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::auto::{MetaDevice, META_DEVICE_ID};
use super::DeviceRegistry;
use crate::serial::scan_usb_names;

/// Time between scans
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Settle time before opening a newly attached adapter
const OPEN_DELAY: Duration = Duration::from_millis(100);

/// Names present in `current` but not `previous`, and the reverse
pub fn diff_snapshots(previous: &[String], current: &[String]) -> (Vec<String>, Vec<String>) {
    let added = current
        .iter()
        .filter(|name| !previous.contains(name))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|name| !current.contains(name))
        .cloned()
        .collect();
    (added, removed)
}

/// Watches for USB serial adapters being plugged in and removed
pub struct UsbWatcher {
    registry: Arc<DeviceRegistry>,
    dev_dir: PathBuf,
    interval: Duration,
    baud_rate: Option<u32>,
}

impl UsbWatcher {
    /// Watch `/dev`, opening new adapters at `baud_rate`
    pub fn new(registry: Arc<DeviceRegistry>, baud_rate: Option<u32>) -> Self {
        Self {
            registry,
            dev_dir: PathBuf::from("/dev"),
            interval: SCAN_INTERVAL,
            baud_rate,
        }
    }

    /// Scan a different directory (tests)
    pub fn with_dev_dir(mut self, dev_dir: impl AsRef<Path>) -> Self {
        self.dev_dir = dev_dir.as_ref().to_path_buf();
        self
    }

    fn port_path(&self, name: &str) -> String {
        self.dev_dir.join(name).to_string_lossy().into_owned()
    }

    /// Apply one scan; returns the new snapshot
    pub async fn scan_once(&self, previous: &[String]) -> Vec<String> {
        let current = scan_usb_names(&self.dev_dir);
        let (added, removed) = diff_snapshots(previous, &current);

        for name in added {
            tracing::info!("USB device added: {}", name);
            sleep(OPEN_DELAY).await;
            let path = self.port_path(&name);
            // a failed open is not retried until the adapter is replugged
            if self.registry.open_port(&path, self.baud_rate) {
                self.registry.register_device(Arc::new(MetaDevice::new(path.as_str())));
                self.registry
                    .spawn_commands(&path, META_DEVICE_ID, &["checksum 1", "devices"]);
            }
        }
        for name in removed {
            tracing::info!("USB device removed: {}", name);
            let path = self.port_path(&name);
            self.registry.close_port(&path).await;
            self.registry.remove_auto_devices(&path);
        }
        current
    }

    /// Scan until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut snapshot = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.scan_once(&snapshot) => snapshot = next,
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_snapshots() {
        let prev = names(&["ttyUSB0", "ttyACM0"]);
        let cur = names(&["ttyACM0", "ttyUSB1"]);
        let (added, removed) = diff_snapshots(&prev, &cur);
        assert_eq!(added, names(&["ttyUSB1"]));
        assert_eq!(removed, names(&["ttyUSB0"]));
    }

    #[test]
    fn test_diff_unchanged() {
        let prev = names(&["ttyUSB0"]);
        let (added, removed) = diff_snapshots(&prev, &prev);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
