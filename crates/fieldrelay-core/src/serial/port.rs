//! A single serial connection shared by the devices on it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};

use super::{discovery, frame, SerialError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Guard proving the holder owns the port for one command/ack cycle.
///
/// Dropping the guard releases the port.
pub type PortGuard<'a> = MutexGuard<'a, ()>;

/// One open serial port.
///
/// Reads and writes are framed per line. Transport failures are logged and
/// swallowed here: flaky USB adapters are expected, and recovery (resend,
/// timeout) belongs to the device protocol above.
pub struct SerialPort {
    name: String,
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    /// Held for a whole command/ack cycle so device conversations never interleave
    busy: Mutex<()>,
    /// Set when the most recent frame on this port failed its checksum
    checksum_error: AtomicBool,
    tx_frames: AtomicU64,
    rx_frames: AtomicU64,
}

impl SerialPort {
    /// Wrap an already connected reader/writer pair
    pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name: name.into(),
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            busy: Mutex::new(()),
            checksum_error: AtomicBool::new(false),
            tx_frames: AtomicU64::new(0),
            rx_frames: AtomicU64::new(0),
        }
    }

    /// Open a physical serial port
    pub fn open(name: &str, baud_rate: Option<u32>) -> Result<Self, SerialError> {
        let stream = discovery::open_port(name, baud_rate)?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self::new(name, reader, writer))
    }

    /// Port name (e.g. `/dev/ttyUSB0`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one line from the port.
    ///
    /// Returns `None` at end of stream or on a read error. The returned line is
    /// trimmed and may be empty.
    pub async fn read_message(&self) -> Option<String> {
        let mut buf = Vec::new();
        let mut reader = self.reader.lock().await;
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                self.rx_frames.fetch_add(1, Ordering::Relaxed);
                Some(String::from_utf8_lossy(&buf).trim().to_string())
            }
            Err(e) => {
                tracing::debug!("serial read error on {}: {}", self.name, e);
                None
            }
        }
    }

    /// Write a command, adding its checksum and line terminator.
    pub async fn write_command(&self, command: &str) {
        let line = format!("{}\n", frame::encode(command));
        let mut writer = self.writer.lock().await;
        let result = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.tx_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::info!("serial write error on {}: {}", self.name, e),
        }
    }

    /// Wait for exclusive use of the port
    pub async fn acquire(&self) -> PortGuard<'_> {
        self.busy.lock().await
    }

    /// Returns true while a command/ack cycle holds the port
    pub fn is_busy(&self) -> bool {
        self.busy.try_lock().is_err()
    }

    /// Flag the port after a corrupt frame
    pub fn set_checksum_error(&self) {
        self.checksum_error.store(true, Ordering::SeqCst);
    }

    /// Clear the checksum flag at the start of a command
    pub fn clear_checksum_error(&self) {
        self.checksum_error.store(false, Ordering::SeqCst);
    }

    /// Whether a corrupt frame arrived since the flag was last cleared
    pub fn checksum_error(&self) -> bool {
        self.checksum_error.load(Ordering::SeqCst)
    }

    /// Frames written and lines read since the port was opened
    pub fn counters(&self) -> (u64, u64) {
        (
            self.tx_frames.load(Ordering::Relaxed),
            self.rx_frames.load(Ordering::Relaxed),
        )
    }

    /// Shut down the write half; errors are ignored since the device may already be gone
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPort")
            .field("name", &self.name)
            .field("busy", &self.is_busy())
            .field("checksum_error", &self.checksum_error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_write_command_frames_line() {
        let (host, mut device) = duplex(256);
        let (r, w) = tokio::io::split(host);
        let port = SerialPort::new("test", r, w);

        port.write_command("a:q").await;

        let mut buf = vec![0u8; 10];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"a:q|20350\n");
        assert_eq!(port.counters(), (1, 0));
    }

    #[tokio::test]
    async fn test_read_message_trims() {
        let (host, mut device) = duplex(256);
        let (r, w) = tokio::io::split(host);
        let port = SerialPort::new("test", r, w);

        device.write_all(b"a:ack q|56585\r\n").await.unwrap();
        assert_eq!(port.read_message().await.as_deref(), Some("a:ack q|56585"));
    }

    #[tokio::test]
    async fn test_read_message_none_at_eof() {
        let (host, device) = duplex(256);
        let (r, w) = tokio::io::split(host);
        let port = SerialPort::new("test", r, w);
        drop(device);

        assert_eq!(port.read_message().await, None);
    }

    #[tokio::test]
    async fn test_write_to_closed_device_is_swallowed() {
        let (host, device) = duplex(256);
        let (r, w) = tokio::io::split(host);
        let port = SerialPort::new("test", r, w);
        drop(device);

        port.write_command("a:q").await;
        assert_eq!(port.counters(), (0, 0));
    }

    #[tokio::test]
    async fn test_busy_guard_released_on_drop() {
        let (host, _device) = duplex(256);
        let (r, w) = tokio::io::split(host);
        let port = SerialPort::new("test", r, w);

        {
            let _guard = port.acquire().await;
            assert!(port.is_busy());
        }
        assert!(!port.is_busy());
    }

    #[test]
    fn test_checksum_flag() {
        let (host, _device) = duplex(16);
        let (r, w) = tokio::io::split(host);
        let port = SerialPort::new("test", r, w);
        assert!(!port.checksum_error());
        port.set_checksum_error();
        assert!(port.checksum_error());
        port.clear_checksum_error();
        assert!(!port.checksum_error());
    }
}
