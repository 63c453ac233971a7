use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use super::{DeviceCatalog, UsbId};
use crate::serial::available_usb_ports;

/// Events emitted by the port monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// A whitelisted device appeared
    Attached(UsbId),
    /// A whitelisted device went away
    Detached(UsbId),
}

/// Source of hot-plug notifications
#[async_trait::async_trait]
pub trait PortMonitor: Send + Sync {
    /// Start monitoring for port changes
    async fn start(&mut self) -> anyhow::Result<()>;

    /// Stop monitoring
    async fn stop(&mut self) -> anyhow::Result<()>;

    /// Get receiver for port events; only the first call returns it
    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

/// Events that turn `previous` into `current`, detaches first
pub fn diff_ports(previous: &BTreeSet<UsbId>, current: &BTreeSet<UsbId>) -> Vec<PortEvent> {
    previous
        .difference(current)
        .map(|id| PortEvent::Detached(*id))
        .chain(current.difference(previous).map(|id| PortEvent::Attached(*id)))
        .collect()
}

/// Polls the OS port list and reports whitelisted devices coming and going.
///
/// Devices already present on the first poll form the baseline and are not
/// reported.
pub struct PollingPortMonitor {
    catalog: Arc<DeviceCatalog>,
    interval: Duration,
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    stop_tx: Option<mpsc::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(catalog: Arc<DeviceCatalog>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(100);

        Self {
            catalog,
            interval,
            tx: Some(tx),
            rx: Some(rx),
            stop_tx: None,
            task_handle: None,
        }
    }

    async fn snapshot(catalog: &DeviceCatalog) -> anyhow::Result<BTreeSet<UsbId>> {
        let ports = tokio::task::spawn_blocking(available_usb_ports).await??;
        Ok(ports
            .into_iter()
            .map(|info| UsbId::new(info.vid, info.pid))
            .filter(|id| catalog.is_known(id.vendor_id, id.product_id))
            .collect())
    }
}

#[async_trait::async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> anyhow::Result<()> {
        let tx = self.tx.take().ok_or_else(|| anyhow::anyhow!("Port monitor already started"))?;
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let catalog = self.catalog.clone();
        let mut interval = tokio::time::interval(self.interval);

        let handle = tokio::spawn(async move {
            let mut known: Option<BTreeSet<UsbId>> = None;

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        log::info!("Port monitor stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let current = match PollingPortMonitor::snapshot(&catalog).await {
                            Ok(current) => current,
                            Err(e) => {
                                log::warn!("Port enumeration failed: {}", e);
                                continue;
                            }
                        };

                        if let Some(previous) = &known {
                            for event in diff_ports(previous, &current) {
                                log::debug!("Port event: {:?}", event);
                                if tx.send(event).await.is_err() {
                                    log::debug!("Port event receiver dropped");
                                    return;
                                }
                            }
                        }
                        known = Some(current);
                    }
                }
            }
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }

        if let Some(handle) = self.task_handle.take() {
            handle.await?;
        }

        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}
