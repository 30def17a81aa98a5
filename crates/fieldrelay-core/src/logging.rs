//! Log destinations beyond the console
//!
//! [`ServerLogLayer`] is a `tracing-subscriber` layer that sends events from
//! this crate's targets to the `log` sequence as `"LEVEL: message"`. The
//! sequence client is attached after startup through a [`ServerLogHandle`],
//! since the subscriber is installed before the controller exists.
//!
//! [`file_writer`] opens the on-disk log: `logs/client-log.txt` rotated by
//! size, or one file per run.

use chrono::Local;
use std::cell::Cell;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::config::Config;
use crate::sequences::SequenceClient;

/// Directory of the log files, relative to the working directory
pub const LOG_DIR: &str = "logs";

/// Name of the size-bounded log file
pub const LOG_FILE_NAME: &str = "client-log.txt";

/// Default `max_log_file_size`
pub const DEFAULT_MAX_LOG_FILE_SIZE: u64 = 10_000_000;

/// Rotated copies kept next to the log file
pub const LOG_FILE_BACKUPS: usize = 10;

/// Only events whose target starts with this are forwarded
const TARGET_PREFIX: &str = "fieldrelay";

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Parse a level name such as `"warn"`; unknown names yield `None`
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "critical" => Some(Level::ERROR),
        _ => None,
    }
}

/// Log file that is renamed to `<name>.1` once it would exceed its size
/// bound; older copies shift up to `<name>.<backups>`, and the oldest is
/// dropped
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    /// Append to `path`; a `max_bytes` of zero never rotates
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    /// Path of rotated copy `n`
    pub fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups > 0 {
            for n in (1..self.backups).rev() {
                let from = self.backup_path(n);
                if from.exists() {
                    fs::rename(&from, self.backup_path(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl io::Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Open the on-disk log in `dir` as configured.
///
/// With `log_file_per_run` every run writes `<YYYY-mm-dd-HHMMSS>.txt`;
/// otherwise `client-log.txt` rotates at `max_log_file_size` bytes. Lines are
/// written by a background thread until the returned guard is dropped.
pub fn file_writer(config: &Config, dir: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(dir)?;
    if config.get_bool("log_file_per_run", false) {
        let stamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(stamp)
            .filename_suffix("txt")
            .build(dir)
            .map_err(io::Error::other)?;
        return Ok(tracing_appender::non_blocking(appender));
    }
    let max_bytes = config
        .get_u64("max_log_file_size")
        .unwrap_or(DEFAULT_MAX_LOG_FILE_SIZE);
    let file = RotatingFile::open(dir.join(LOG_FILE_NAME), max_bytes, LOG_FILE_BACKUPS)?;
    Ok(tracing_appender::non_blocking(file))
}

/// Attaches the sequence client once it exists
#[derive(Clone, Default)]
pub struct ServerLogHandle {
    sequences: Arc<OnceLock<Arc<SequenceClient>>>,
}

impl ServerLogHandle {
    /// Start forwarding; later calls are ignored
    pub fn attach(&self, sequences: Arc<SequenceClient>) {
        let _ = self.sequences.set(sequences);
    }

    /// Whether a sequence client has been attached
    pub fn is_attached(&self) -> bool {
        self.sequences.get().is_some()
    }
}

/// Layer sending log events to the server
pub struct ServerLogLayer {
    level: Level,
    handle: ServerLogHandle,
}

impl ServerLogLayer {
    /// Forward events at `level` or more severe
    pub fn new(level: Level) -> (Self, ServerLogHandle) {
        let handle = ServerLogHandle::default();
        (
            Self {
                level,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

/// Text sent for one event
pub fn format_event(level: &Level, message: &str) -> String {
    format!("{}: {}", level, message)
}

impl<S: Subscriber> Layer<S> for ServerLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Level orders more verbose as greater
        if *metadata.level() > self.level || !metadata.target().starts_with(TARGET_PREFIX) {
            return;
        }
        let Some(sequences) = self.handle.sequences.get() else {
            return;
        };
        if FORWARDING.with(|f| f.replace(true)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);
        sequences.update("log", format_event(metadata.level(), &visitor.message));

        FORWARDING.with(|f| f.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::messages::OutboundQueue;
    use crate::resources::ResourceClient;
    use serde_json::json;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_rotating_file_keeps_bounded_backups() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let mut file = RotatingFile::open(dir.path().join(LOG_FILE_NAME), 20, 2).unwrap();
        for line in ["first line 0001\n", "second line 002\n", "third line 0003\n", "fourth line 004\n"] {
            file.write_all(line.as_bytes()).unwrap();
        }
        file.flush().unwrap();

        let read = |p: PathBuf| fs::read_to_string(p).unwrap();
        assert_eq!(read(dir.path().join(LOG_FILE_NAME)), "fourth line 004\n");
        assert_eq!(read(file.backup_path(1)), "third line 0003\n");
        assert_eq!(read(file.backup_path(2)), "second line 002\n");
        assert!(!file.backup_path(3).exists());
    }

    #[test]
    fn test_rotating_file_appends_to_existing_log() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE_NAME);
        fs::write(&path, "earlier run\n").unwrap();

        let mut file = RotatingFile::open(&path, 0, 2).unwrap();
        file.write_all(b"this run\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "earlier run\nthis run\n");
        assert!(!file.backup_path(1).exists());
    }

    #[test]
    fn test_file_writer_per_run() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_value(json!({"log_file_per_run": true})).unwrap();
        let (mut writer, guard) = file_writer(&config, dir.path()).unwrap();
        writer.write_all(b"hello\n").unwrap();
        drop(guard);

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".txt"));
        assert_ne!(names[0], LOG_FILE_NAME);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARNING"), Some(Level::WARN));
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_forwards_crate_events_at_level() {
        let queue = Arc::new(OutboundQueue::new());
        let sequences = Arc::new(SequenceClient::new(
            Config::new().into_shared(),
            queue.clone(),
            Arc::new(ResourceClient::new("localhost", false, "test")),
        ));
        let (layer, handle) = ServerLogLayer::new(Level::INFO);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "fieldrelay_core::test", "before attach");
            handle.attach(sequences);
            tracing::debug!(target: "fieldrelay_core::test", "too verbose");
            tracing::warn!(target: "other_crate", "foreign");
            tracing::warn!(target: "fieldrelay_core::test", "port {} lost", "ttyUSB0");
        });

        let sent = queue.snapshot();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].envelope.message_type, "update_sequence");
        assert_eq!(
            sent[0].envelope.parameters,
            json!({"sequence": "log", "value": "WARN: port ttyUSB0 lost"})
        );
    }
}
