mod common;

use common::{attach_sim_port, device_send, registry_with, spawn_echo_device};
use fieldrelay_core::device::{
    protocol, BasicDevice, CommandOptions, Device, DeviceCore, DeviceError, META_DEVICE_ID,
    MetaDevice, UsbWatcher,
};
use fieldrelay_core::serial::{SerialError, SerialPort};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncBufReadExt, BufReader};
use tokio::time::Instant;

/// Wait until `check` passes, polling every 10 ms for up to two seconds
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_send_command_to_echo_device() {
    let (registry, _queue) = registry_with(json!({}));
    let device_end = attach_sim_port(&registry, "sim0");
    let _device = spawn_echo_device(device_end);
    registry.register_device(Arc::new(BasicDevice::new("a", "sim0")));

    registry.send_command("a", "checksum 1").await.unwrap();
    let device = registry.device("sim0", "a").unwrap();
    assert_eq!(device.core().last_ack(), "checksum 1");
}

#[tokio::test]
async fn test_send_command_unknown_device() {
    let (registry, _queue) = registry_with(json!({}));
    let _device_end = attach_sim_port(&registry, "sim0");
    assert_eq!(
        registry.send_command("zz", "q").await,
        Err(DeviceError::NotFound("zz".into()))
    );
}

#[tokio::test]
async fn test_commands_without_ports_are_simulated() {
    let (registry, _queue) = registry_with(json!({}));
    let device: Arc<dyn Device> = Arc::new(BasicDevice::new("a", "sim"));
    registry.register_device(device.clone());
    registry.send_to_device(device.as_ref(), "q").await.unwrap();
    registry.send_command("a", "q").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_times_out_at_configured_timeout() {
    let (host, _device_end) = duplex(4096);
    let (r, w) = tokio::io::split(host);
    let port = SerialPort::new("sim0", r, w);
    let core = DeviceCore::new("a", "sim0");
    let options = CommandOptions::default();

    let start = Instant::now();
    let result = protocol::send_command(&port, &core, "q", &options).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(DeviceError::AckTimeout { .. })));
    assert!(elapsed >= options.timeout);
    assert!(elapsed <= options.timeout + options.poll_interval);
}

#[tokio::test(start_paused = true)]
async fn test_checksum_error_requests_resend() {
    let (host, device_end) = duplex(4096);
    let (r, w) = tokio::io::split(host);
    let port = Arc::new(SerialPort::new("sim0", r, w));
    let core = Arc::new(DeviceCore::new("a", "sim0"));
    let options = CommandOptions {
        resend_on_checksum_error: true,
        ..CommandOptions::default()
    };

    // device side: ack the command but flag a corrupt frame first, then ack the resend
    let (dev_r, _dev_w) = tokio::io::split(device_end);
    let flag_port = port.clone();
    let ack_core = core.clone();
    let device = tokio::spawn(async move {
        let mut lines = BufReader::new(dev_r).lines();
        let mut sent = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            sent.push(line.clone());
            if line.starts_with("a:info|") {
                flag_port.set_checksum_error();
                ack_core.set_last_ack("info");
            } else if line.starts_with("a:qr|") {
                ack_core.set_last_ack("qr");
                break;
            }
        }
        sent
    });

    protocol::send_command(&port, &core, "info", &options).await.unwrap();
    let sent = device.await.unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].starts_with("a:qr|"));
}

#[tokio::test]
async fn test_unprefixed_frame_goes_to_sole_device() {
    let (registry, queue) = registry_with(json!({}));
    let mut device_end = attach_sim_port(&registry, "sim0");
    registry.register_device(Arc::new(BasicDevice::new("a", "sim0")));

    device_send(&mut device_end, "log pump started").await;

    eventually(|| !queue.is_empty()).await;
    let sent = queue.snapshot();
    assert_eq!(sent[0].envelope.message_type, "update_sequence");
    assert_eq!(
        sent[0].envelope.parameters,
        json!({"sequence": "log", "value": "a: pump started"})
    );
    assert_eq!(registry.error_count(), 0);
}

#[tokio::test]
async fn test_unprefixed_frame_with_several_devices_counts_error() {
    let (registry, queue) = registry_with(json!({}));
    let mut device_end = attach_sim_port(&registry, "sim0");
    registry.register_device(Arc::new(BasicDevice::new("a", "sim0")));
    registry.register_device(Arc::new(BasicDevice::new("b", "sim0")));

    device_send(&mut device_end, "log hello").await;

    eventually(|| registry.error_count() == 1).await;
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_corrupt_frame_counts_error_and_flags_port() {
    let (registry, _queue) = registry_with(json!({}));
    let mut device_end = attach_sim_port(&registry, "sim0");
    registry.register_device(Arc::new(BasicDevice::new("a", "sim0")));

    use tokio::io::AsyncWriteExt;
    device_end.write_all(b"a:ack q|1\n").await.unwrap();

    eventually(|| registry.error_count() == 1).await;
    assert!(registry.port(Some("sim0")).unwrap().checksum_error());
    assert_eq!(registry.device("sim0", "a").unwrap().core().last_ack(), "");
}

#[test]
fn test_process_frame_runs_serial_handlers_until_used() {
    let (registry, _queue) = registry_with(json!({}));
    registry.register_device(Arc::new(BasicDevice::new("a", "sim")));
    let calls = Arc::new(AtomicUsize::new(0));
    for used in [true, true] {
        let calls = calls.clone();
        registry.add_serial_handler(Arc::new(move |id: &str, command: &str, args: &[String]| {
            assert_eq!((id, command), ("a", "temp"));
            assert_eq!(args, ["21.5".to_string()]);
            calls.fetch_add(1, Ordering::SeqCst);
            used
        }));
    }

    registry.process_frame("sim", &fieldrelay_core::serial::frame::encode("a:temp 21.5"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // acks are used by the device itself
    registry.process_frame("sim", &fieldrelay_core::serial::frame::encode("a:ack q"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_forward_serial_to_server() {
    let (registry, queue) = registry_with(json!({}));
    registry.register_device(Arc::new(BasicDevice::new("a", "sim")));
    registry.set_send_serial_to_server(true);

    registry.process_frame("sim", &fieldrelay_core::serial::frame::encode("a:ack q"));
    let sent = queue.snapshot();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].envelope.message_type, "serialMessage");
    assert_eq!(sent[0].envelope.parameters, json!({"message": "a:ack q"}));
}

#[tokio::test]
async fn test_meta_device_registers_auto_devices() {
    let (registry, _queue) = registry_with(json!({}));
    let device_end = attach_sim_port(&registry, "sim0");
    let _device = spawn_echo_device(device_end);
    registry.register_device(Arc::new(MetaDevice::new("sim0")));

    let body = format!("{}:devices t1 t2", META_DEVICE_ID);
    registry.process_frame("sim0", &fieldrelay_core::serial::frame::encode(&body));

    assert!(registry.device("sim0", "t1").is_some());
    assert!(registry.device("sim0", "t2").is_some());
    assert_eq!(registry.auto_devices().list().len(), 2);

    // "checksum 1" then "info" go out to each new device
    eventually(|| registry.device("sim0", "t2").unwrap().core().last_ack() == "info").await;
}

#[tokio::test]
async fn test_auto_device_type_and_values() {
    let (registry, queue) = registry_with(json!({}));
    registry.register_device(Arc::new(MetaDevice::new("sim")));
    registry.process_frame("sim", &fieldrelay_core::serial::frame::encode("meta:devices t1"));

    registry.process_frame("sim", &fieldrelay_core::serial::frame::encode("t1:type temperature"));
    registry.process_frame("sim", &fieldrelay_core::serial::frame::encode("t1:units C"));
    registry.process_frame("sim", &fieldrelay_core::serial::frame::encode("t1:v 21.5"));

    let types = queue.pending_types();
    assert!(types.contains(&"device_added".to_string()));
    assert!(types.contains(&"sensor_update".to_string()));
    assert_eq!(registry.auto_devices().find("temperature").unwrap().core().id(), "t1");
}

#[tokio::test]
async fn test_close_port_removes_devices() {
    let (registry, queue) = registry_with(json!({}));
    let _device_end = attach_sim_port(&registry, "sim0");
    registry.register_device(Arc::new(MetaDevice::new("sim0")));
    registry.process_frame("sim0", &fieldrelay_core::serial::frame::encode("meta:devices t1"));

    assert!(registry.close_port("sim0").await);
    registry.remove_auto_devices("sim0");

    assert!(registry.devices().is_empty());
    assert!(!registry.is_connected());
    assert!(queue.pending_types().contains(&"device_removed".to_string()));
}

#[tokio::test]
async fn test_usb_removal_closes_port_and_reports_devices() {
    let dev_dir = tempfile::tempdir().unwrap();
    let (registry, queue) = registry_with(json!({}));
    let path = dev_dir.path().join("ttyUSB0").to_string_lossy().into_owned();
    let _device_end = attach_sim_port(&registry, &path);
    registry.register_device(Arc::new(MetaDevice::new(path.as_str())));
    registry.process_frame(&path, &fieldrelay_core::serial::frame::encode("meta:devices t1"));
    assert!(registry.device(&path, "t1").is_some());

    // the adapter is gone from the directory
    let watcher = UsbWatcher::new(registry.clone(), None).with_dev_dir(dev_dir.path());
    let snapshot = watcher.scan_once(&["ttyUSB0".to_string()]).await;

    assert!(snapshot.is_empty());
    assert!(registry.port_names().is_empty());
    assert!(registry.devices().is_empty());
    assert!(registry.auto_devices().list().is_empty());
    assert!(queue.pending_types().contains(&"device_removed".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_usb_scan_reports_new_adapters() {
    let dev_dir = tempfile::tempdir().unwrap();
    std::fs::write(dev_dir.path().join("ttyACM0"), b"").unwrap();
    std::fs::write(dev_dir.path().join("ttyS0"), b"").unwrap();
    let (registry, _queue) = registry_with(json!({}));

    let watcher = UsbWatcher::new(registry.clone(), None).with_dev_dir(dev_dir.path());
    let snapshot = watcher.scan_once(&[]).await;

    // a plain file is no serial port, so nothing is opened
    assert_eq!(snapshot, vec!["ttyACM0"]);
    assert!(registry.port_names().is_empty());
    assert_eq!(watcher.scan_once(&snapshot).await, snapshot);
}

#[tokio::test]
async fn test_port_names_are_unique() {
    let (registry, _queue) = registry_with(json!({}));
    let _first = attach_sim_port(&registry, "sim0");

    let (host, _second) = duplex(64);
    let (r, w) = tokio::io::split(host);
    let duplicate = registry.attach_port(SerialPort::new("sim0", r, w));
    assert!(matches!(duplicate, Err(SerialError::AlreadyOpen(name)) if name == "sim0"));
    assert!(!registry.open_port("sim0", None));
    assert_eq!(registry.port_names(), vec!["sim0"]);
}

#[tokio::test(start_paused = true)]
async fn test_poll_cycle_polls_enabled_devices() {
    let (registry, _queue) = registry_with(json!({"serial": {"poll_sleep": 0.05}}));
    let device_end = attach_sim_port(&registry, "sim0");
    let _device = spawn_echo_device(device_end);
    let polled = Arc::new(BasicDevice::new("a", "sim0"));
    polled.core().enable_polling(true);
    registry.register_device(polled.clone());
    registry.register_device(Arc::new(BasicDevice::new("b", "sim0")));

    assert_eq!(registry.poll_cycle().await, 1);
    assert_eq!(polled.core().last_ack(), "q");
    assert_eq!(registry.device("sim0", "b").unwrap().core().last_ack(), "");
}

#[tokio::test(start_paused = true)]
async fn test_fast_polling_polls_every_cycle() {
    let (registry, _queue) = registry_with(json!({}));
    let device_end = attach_sim_port(&registry, "sim0");
    let _device = spawn_echo_device(device_end);
    let fast = Arc::new(BasicDevice::new("a", "sim0"));
    fast.core().enable_polling(true);
    registry.register_device(fast.clone());
    registry.set_fast_polling(Some(vec!["a".to_string()]));

    let start = Instant::now();
    let mut cycles = 0;
    let mut polls = 0;
    while start.elapsed() < Duration::from_secs(3) {
        polls += registry.poll_cycle().await;
        cycles += 1;
    }

    // 50 ms ack check plus the 100 ms fast batch delay per poll
    assert_eq!(polls, cycles);
    assert!((18..=21).contains(&polls), "{} polls in 3s", polls);
}

#[test]
fn test_poll_delay_defaults() {
    let (registry, _queue) = registry_with(json!({}));
    assert_eq!(registry.poll_delay(1, false), Duration::from_millis(400));
    assert_eq!(registry.poll_delay(2, false), Duration::from_millis(300));
    assert_eq!(registry.poll_delay(5, false), Duration::from_millis(200));
    assert_eq!(registry.poll_delay(5, true), Duration::from_millis(100));
}
