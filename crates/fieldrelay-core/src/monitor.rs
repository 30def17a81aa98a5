//! System status reports
//!
//! Shortly after startup and then every half hour, processor and root disk
//! usage are stored as sequences under `<controller folder>/status`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::resources::ResourceClient;
use crate::sequences::SequenceClient;

/// Wait before the first report
pub const MONITOR_START_DELAY: Duration = Duration::from_secs(15);

/// Time between reports
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Usage above this percentage is logged
pub const HIGH_USAGE_PERCENT: f64 = 80.0;

/// One usage sample, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemUsage {
    /// Processor usage since the previous sample
    pub processor: f64,
    /// Used share of the root filesystem
    pub disk: f64,
}

impl SystemUsage {
    /// Whether either value is worth a log line
    pub fn is_high(&self) -> bool {
        self.processor > HIGH_USAGE_PERCENT || self.disk > HIGH_USAGE_PERCENT
    }

    /// Sequence values for a controller folder
    pub fn sequence_values(&self, controller_path: &str) -> BTreeMap<String, Value> {
        let folder = format!("{}/status", controller_path.trim_end_matches('/'));
        BTreeMap::from([
            (format!("{}/processor_usage", folder), Value::from(round1(self.processor))),
            (format!("{}/disk_usage", folder), Value::from(round1(self.disk))),
        ])
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Used percentage of a filesystem
pub fn used_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(available) as f64 * 100.0 / total as f64
}

/// Samples processor and disk usage
pub struct SystemMonitor {
    system: System,
    disks: Disks,
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMonitor {
    /// Start measuring; processor usage is relative to this call
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Usage since the previous sample
    pub fn sample(&mut self) -> SystemUsage {
        self.system.refresh_cpu();
        self.disks.refresh();
        let root = self
            .disks
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .or_else(|| self.disks.iter().next());
        SystemUsage {
            processor: f64::from(self.system.global_cpu_info().cpu_usage()),
            disk: root
                .map(|d| used_percent(d.total_space(), d.available_space()))
                .unwrap_or(0.0),
        }
    }

    /// Report usage until cancelled
    pub async fn run(
        mut self,
        resources: Arc<ResourceClient>,
        sequences: Arc<SequenceClient>,
        cancel: CancellationToken,
    ) {
        let mut wait = MONITOR_START_DELAY;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
            wait = MONITOR_INTERVAL;

            let usage = self.sample();
            let path = match resources.own_path().await {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("unable to report system status: {}", e);
                    continue;
                }
            };
            if let Err(e) = sequences.update_multiple(&usage.sequence_values(&path), None).await {
                tracing::warn!("unable to report system status: {}", e);
            }
            if usage.is_high() {
                tracing::info!(
                    "processor usage: {:.1}%, disk usage: {:.1}%",
                    usage.processor,
                    usage.disk
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_sequence_values() {
        let usage = SystemUsage {
            processor: 12.345,
            disk: 81.0,
        };
        let values = usage.sequence_values("/farm/barn/");
        assert_eq!(values["/farm/barn/status/processor_usage"], json!(12.3));
        assert_eq!(values["/farm/barn/status/disk_usage"], json!(81.0));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_high_usage_threshold() {
        let calm = SystemUsage {
            processor: 80.0,
            disk: 40.0,
        };
        assert!(!calm.is_high());
        assert!(SystemUsage { disk: 80.5, ..calm }.is_high());
    }

    #[test]
    fn test_used_percent() {
        assert_eq!(used_percent(200, 50), 75.0);
        assert_eq!(used_percent(0, 0), 0.0);
        assert_eq!(used_percent(100, 150), 0.0);
    }

    #[test]
    fn test_sample_is_a_percentage() {
        let mut monitor = SystemMonitor::new();
        let usage = monitor.sample();
        assert!((0.0..=100.0).contains(&usage.disk));
        assert!(usage.processor >= 0.0);
    }
}
