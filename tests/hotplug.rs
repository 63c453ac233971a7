use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use fc_serial_lib::device::{PortEvent, PortMonitor, UsbId};
use fc_serial_lib::serial::{
    MockTransport, PermissionRequest, PermissionResponse, ReadHandler, ReadSubscription,
    Result as SerialResult, SerialTransport,
};
use fc_serial_lib::{ConnectionOptions, ConnectionState, DeviceManager, EventKind, SerialEvent, SerialSettings};

/// Monitor fed by the test through a channel
struct ScriptedMonitor {
    rx: Option<mpsc::Receiver<PortEvent>>,
    stopped: Arc<Mutex<bool>>,
}

#[async_trait::async_trait]
impl PortMonitor for ScriptedMonitor {
    async fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        *self.stopped.lock().unwrap() = true;
        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}

/// Mock transport whose close takes a while
struct SlowCloseTransport {
    inner: MockTransport,
    close_delay: Duration,
}

#[async_trait::async_trait]
impl SerialTransport for SlowCloseTransport {
    async fn request_serial_permissions(&self, request: PermissionRequest) -> SerialResult<PermissionResponse> {
        self.inner.request_serial_permissions(request).await
    }

    async fn open_connection(&self, path: &str, options: &ConnectionOptions) -> SerialResult<()> {
        self.inner.open_connection(path, options).await
    }

    async fn write(&self, data: &[u8]) -> SerialResult<usize> {
        self.inner.write(data).await
    }

    async fn register_read_callback(&self, handler: ReadHandler) -> SerialResult<ReadSubscription> {
        self.inner.register_read_callback(handler).await
    }

    async fn unregister_read_callback(&self, subscription: ReadSubscription) -> SerialResult<()> {
        self.inner.unregister_read_callback(subscription).await
    }

    async fn close_connection(&self) -> SerialResult<()> {
        tokio::time::sleep(self.close_delay).await;
        self.inner.close_connection().await
    }
}

fn scripted() -> (ScriptedMonitor, mpsc::Sender<PortEvent>, Arc<Mutex<bool>>) {
    let (tx, rx) = mpsc::channel(8);
    let stopped = Arc::new(Mutex::new(false));
    (ScriptedMonitor { rx: Some(rx), stopped: stopped.clone() }, tx, stopped)
}

fn manager() -> (Arc<DeviceManager>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let manager = DeviceManager::new(transport.clone(), SerialSettings::default());
    (Arc::new(manager), transport)
}

#[tokio::test]
async fn test_attach_and_detach_update_registry() {
    let (manager, _transport) = manager();
    let stm = UsbId::new(0x0483, 0x5740);

    manager.handle_port_event(PortEvent::Attached(stm)).await.unwrap();
    manager.handle_port_event(PortEvent::Attached(stm)).await.unwrap();
    assert_eq!(manager.cached_devices().await.len(), 1);

    manager.handle_port_event(PortEvent::Detached(stm)).await.unwrap();
    assert!(manager.cached_devices().await.is_empty());
}

#[tokio::test]
async fn test_detaching_connected_device_disconnects() {
    let (manager, transport) = manager();
    let stm = UsbId::new(0x0483, 0x5740);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.subscribe(EventKind::Disconnect, move |e| sink.lock().unwrap().push(e.clone()));

    manager.handle_port_event(PortEvent::Attached(stm)).await.unwrap();
    manager.connect("serial", &manager.default_options()).await.unwrap();

    manager.handle_port_event(PortEvent::Detached(stm)).await.unwrap();

    assert!(!manager.status().await.is_open);
    assert!(!transport.is_open());
    assert_eq!(*events.lock().unwrap(), vec![SerialEvent::Disconnect(true)]);
}

#[tokio::test]
async fn test_detaching_other_device_keeps_connection() {
    let (manager, _transport) = manager();
    manager.handle_port_event(PortEvent::Attached(UsbId::new(0x0483, 0x5740))).await.unwrap();
    manager.connect("serial", &manager.default_options()).await.unwrap();
    manager.handle_port_event(PortEvent::Attached(UsbId::new(0x10C4, 0xEA60))).await.unwrap();

    manager.handle_port_event(PortEvent::Detached(UsbId::new(0x10C4, 0xEA60))).await.unwrap();

    assert!(manager.status().await.is_open);
}

#[tokio::test]
async fn test_monitor_events_flow_into_registry() {
    let (manager, _transport) = manager();
    let (monitor, tx, stopped) = scripted();

    manager.start_hotplug_with(Box::new(monitor)).await.unwrap();
    tx.send(PortEvent::Attached(UsbId::new(0x1A86, 0x7523))).await.unwrap();

    for _ in 0..100 {
        if !manager.cached_devices().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let devices = manager.cached_devices().await;
    assert_eq!(devices[0].display_name, "QinHeng Electronics");

    manager.shutdown().await.unwrap();
    assert!(*stopped.lock().unwrap());
}

#[tokio::test]
async fn test_device_attached_after_connect_is_the_connected_one() {
    let (manager, transport) = manager();
    let stm = UsbId::new(0x0483, 0x5740);

    manager.connect("serial", &manager.default_options()).await.unwrap();
    manager.handle_port_event(PortEvent::Attached(stm)).await.unwrap();
    assert_eq!(manager.connected_device().await.map(|d| d.usb_id()), Some(stm));

    manager.handle_port_event(PortEvent::Detached(stm)).await.unwrap();

    assert!(!manager.status().await.is_open);
    assert!(!transport.is_open());
}

#[tokio::test]
async fn test_granted_device_is_tracked_when_not_first() {
    let (manager, transport) = manager();
    let stm = UsbId::new(0x0483, 0x5740);
    let cp210x = UsbId::new(0x10C4, 0xEA60);
    transport.grant(cp210x.vendor_id, cp210x.product_id);

    manager.handle_port_event(PortEvent::Attached(stm)).await.unwrap();
    manager.handle_port_event(PortEvent::Attached(cp210x)).await.unwrap();
    manager.connect("serial", &manager.default_options()).await.unwrap();
    assert_eq!(manager.connected_device().await.map(|d| d.usb_id()), Some(cp210x));

    manager.handle_port_event(PortEvent::Detached(stm)).await.unwrap();
    assert!(manager.status().await.is_open);

    manager.handle_port_event(PortEvent::Detached(cp210x)).await.unwrap();
    assert!(!manager.status().await.is_open);
}

#[tokio::test]
async fn test_attach_requests_grant_from_transport() {
    let (manager, transport) = manager();
    transport.grant(0x0483, 0x5740);

    manager.handle_port_event(PortEvent::Attached(UsbId::new(0x0483, 0x5740))).await.unwrap();

    let log = transport.permission_log();
    assert_eq!(log.len(), 1);
    assert_eq!((log[0].vendor_id, log[0].product_id), (0x0483, 0x5740));

    // The cache is filled, so listing does not negotiate again
    assert_eq!(manager.get_devices().await.len(), 1);
    assert_eq!(transport.permission_request_count(), 1);

    manager.connect("serial", &manager.default_options()).await.unwrap();
    assert_eq!(
        manager.connected_device().await.map(|d| d.usb_id()),
        Some(UsbId::new(0x0483, 0x5740))
    );
}

#[tokio::test]
async fn test_losing_granted_device_moves_grant_to_remaining_one() {
    let (manager, transport) = manager();
    let stm = UsbId::new(0x0483, 0x5740);
    let ch340 = UsbId::new(0x1A86, 0x7523);
    transport.grant(stm.vendor_id, stm.product_id);
    transport.grant(ch340.vendor_id, ch340.product_id);

    manager.handle_port_event(PortEvent::Attached(stm)).await.unwrap();
    manager.handle_port_event(PortEvent::Attached(ch340)).await.unwrap();
    manager.connect("serial", &manager.default_options()).await.unwrap();

    manager.handle_port_event(PortEvent::Detached(stm)).await.unwrap();
    assert!(!manager.status().await.is_open);

    manager.connect("serial", &manager.default_options()).await.unwrap();
    assert_eq!(manager.connected_device().await.map(|d| d.usb_id()), Some(ch340));
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_disconnect() {
    let transport = Arc::new(SlowCloseTransport {
        inner: MockTransport::new(),
        close_delay: Duration::from_millis(300),
    });
    let manager = Arc::new(DeviceManager::new(transport.clone(), SerialSettings::default()));
    let stm = UsbId::new(0x0483, 0x5740);
    manager.handle_port_event(PortEvent::Attached(stm)).await.unwrap();
    manager.connect("serial", &manager.default_options()).await.unwrap();

    let (monitor, tx, stopped) = scripted();
    manager.start_hotplug_with(Box::new(monitor)).await.unwrap();
    tx.send(PortEvent::Detached(stm)).await.unwrap();
    // Let the hot-plug task get inside the slow close
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.shutdown().await.unwrap();

    assert!(*stopped.lock().unwrap());
    let status = manager.status().await;
    assert_eq!(status.state, ConnectionState::Closed);
    assert!(status.connection_id.is_none());
    assert!(!transport.inner.is_open());
    assert!(manager.connect("serial", &manager.default_options()).await.unwrap());
}
