use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::config::SerialSettings;
use crate::events::{EventKind, EventNotifier, ListenerId, SerialEvent};
use crate::serial::{ConnectionOptions, NativeTransport, SerialTransport};
use super::{
    ConnectionController, ConnectionState, ConnectionStatus, DeviceCatalog, DeviceRegistry,
    PermissionNegotiator, PollingPortMonitor, PortDescriptor, PortEvent, PortMonitor, Result,
    SendCallback, UsbId,
};

/// Running hot-plug routing: the monitor plus the task draining its events
struct HotplugWorker {
    monitor: Box<dyn PortMonitor>,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Context object tying the registry, permission negotiation and the single
/// connection to one transport.
///
/// Operations assume a cooperative caller: the connection lock serializes
/// them, and invalid transitions are rejected rather than raced.
pub struct DeviceManager {
    settings: SerialSettings,
    transport: Arc<dyn SerialTransport>,
    notifier: Arc<EventNotifier>,
    catalog: Arc<DeviceCatalog>,
    registry: Mutex<DeviceRegistry>,
    negotiator: PermissionNegotiator,
    controller: Mutex<ConnectionController>,
    // Device behind the logical port path, as last granted by the transport
    granted: Mutex<Option<UsbId>>,
    state_rx: watch::Receiver<ConnectionState>,
    hotplug: Mutex<Option<HotplugWorker>>,
}

impl DeviceManager {
    pub fn new(transport: Arc<dyn SerialTransport>, settings: SerialSettings) -> Self {
        let notifier = Arc::new(EventNotifier::new());
        let catalog = Arc::new(DeviceCatalog::from_settings(&settings));
        let registry = DeviceRegistry::new(settings.port_path.clone(), catalog.clone(), notifier.clone());
        let negotiator = PermissionNegotiator::new(catalog.clone(), settings.driver.clone());
        let controller = ConnectionController::new(transport.clone(), notifier.clone());
        let state_rx = controller.watch_state();

        Self {
            settings,
            transport,
            notifier,
            catalog,
            registry: Mutex::new(registry),
            negotiator,
            controller: Mutex::new(controller),
            granted: Mutex::new(None),
            state_rx,
            hotplug: Mutex::new(None),
        }
    }

    /// Manager on top of the desktop serial transport
    pub fn native(settings: SerialSettings) -> Self {
        let transport = Arc::new(NativeTransport::with_path(settings.port_path.clone()));
        Self::new(transport, settings)
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    pub fn notifier(&self) -> Arc<EventNotifier> {
        self.notifier.clone()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Options built from the configured defaults
    pub fn default_options(&self) -> ConnectionOptions {
        ConnectionOptions::with_baud_rate(self.settings.baud_rate)
    }

    /// Known devices; permission negotiation only runs while the cache is empty
    pub async fn get_devices(&self) -> Vec<PortDescriptor> {
        let mut registry = self.registry.lock().await;
        if registry.is_empty() {
            log::debug!("Device cache empty, requesting access");
            if self.negotiator.request_access(self.transport.as_ref(), &mut registry).await {
                *self.granted.lock().await = registry.devices().first().map(|d| d.usb_id());
            }
        }
        registry.devices().to_vec()
    }

    /// Current cache without triggering negotiation
    pub async fn cached_devices(&self) -> Vec<PortDescriptor> {
        self.registry.lock().await.devices().to_vec()
    }

    pub async fn add_device(&self, vendor_id: u16, product_id: u16) -> Option<PortDescriptor> {
        self.registry.lock().await.add_device(vendor_id, product_id)
    }

    pub async fn remove_device(&self, vendor_id: u16, product_id: u16) -> Option<PortDescriptor> {
        self.registry.lock().await.remove_device(vendor_id, product_id)
    }

    pub async fn connect(&self, path: &str, options: &ConnectionOptions) -> Result<bool> {
        self.controller.lock().await.connect(path, options).await
    }

    pub async fn send(&self, data: &[u8], callback: Option<SendCallback>) -> bool {
        self.controller.lock().await.send(data, callback).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.controller.lock().await.disconnect().await
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.controller.lock().await.status()
    }

    /// Follow connection state without taking the connection lock
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn is_open(&self) -> bool {
        *self.state_rx.borrow() == ConnectionState::Open
    }

    /// Device behind the open connection: the granted one, or the only one
    /// registered when no grant is known
    pub async fn connected_device(&self) -> Option<PortDescriptor> {
        if !self.is_open() {
            return None;
        }
        let registry = self.registry.lock().await;
        let granted = *self.granted.lock().await;
        match granted {
            Some(id) => registry.find(id).cloned(),
            None if registry.len() == 1 => registry.devices().first().cloned(),
            None => None,
        }
    }

    /// Take the first registered device the transport grants as the one
    /// behind the port path
    async fn regrant(&self) {
        let candidates: Vec<UsbId> = self.registry.lock().await.devices().iter().map(|d| d.usb_id()).collect();
        let mut granted = self.granted.lock().await;
        if granted.is_some() {
            return;
        }
        for id in candidates {
            if self.negotiator.request_device(self.transport.as_ref(), id).await {
                *granted = Some(id);
                return;
            }
        }
    }

    /// Apply a hot-plug notification to the registry. Losing the connected
    /// device closes the connection.
    pub async fn handle_port_event(&self, event: PortEvent) -> Result<()> {
        match event {
            PortEvent::Attached(id) => {
                self.add_device(id.vendor_id, id.product_id).await;
                self.regrant().await;
                Ok(())
            }
            PortEvent::Detached(id) => {
                let (removed, lost) = {
                    let mut registry = self.registry.lock().await;
                    let Some(removed) = registry.remove_device(id.vendor_id, id.product_id) else {
                        return Ok(());
                    };
                    let mut granted = self.granted.lock().await;
                    let current = *granted;
                    let lost = match current {
                        Some(current) if current == id => {
                            *granted = None;
                            true
                        }
                        Some(_) => false,
                        // No known grant: the connection goes with the last device
                        None => registry.is_empty(),
                    };
                    (removed, lost)
                };

                let result = if lost && self.is_open() {
                    log::info!("Connected device {} was removed, disconnecting", removed.display_name);
                    self.disconnect().await
                } else {
                    Ok(())
                };
                if lost {
                    self.regrant().await;
                }
                result
            }
        }
    }

    /// Start the polling monitor at the configured interval
    pub async fn start_hotplug(self: &Arc<Self>) -> Result<()> {
        let interval = Duration::from_millis(self.settings.hotplug_poll_ms);
        let monitor = PollingPortMonitor::new(self.catalog.clone(), interval);
        self.start_hotplug_with(Box::new(monitor)).await
    }

    /// Route events from `monitor` into the registry until shutdown
    pub async fn start_hotplug_with(self: &Arc<Self>, mut monitor: Box<dyn PortMonitor>) -> Result<()> {
        self.stop_hotplug().await;

        monitor.start().await?;
        let mut rx = monitor
            .get_receiver()
            .ok_or_else(|| anyhow::anyhow!("Port monitor has no event receiver"))?;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    event = rx.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        if let Err(e) = manager.handle_port_event(event).await {
                            log::error!("Failed to handle {:?}: {}", event, e);
                        }
                    }
                }
            }
            log::debug!("Hot-plug task finished");
        });

        *self.hotplug.lock().await = Some(HotplugWorker { monitor, stop_tx, task });
        Ok(())
    }

    /// Stop the monitor and wait for the event in flight, if any, to finish
    pub async fn stop_hotplug(&self) {
        let worker = self.hotplug.lock().await.take();
        let Some(HotplugWorker { mut monitor, stop_tx, task }) = worker else {
            return;
        };

        if let Err(e) = monitor.stop().await {
            log::warn!("Port monitor did not stop cleanly: {}", e);
        }
        let _ = stop_tx.send(()).await;
        if let Err(e) = task.await {
            log::warn!("Hot-plug task ended abnormally: {}", e);
        }
    }

    /// Tear down: stop hot-plug handling and close any open connection
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_hotplug().await;
        self.disconnect().await
    }
}
