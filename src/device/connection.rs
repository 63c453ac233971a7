use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::{ConnectionState, ConnectionStatus, DeviceError, Result, SendCallback, SendResult};
use crate::events::{EventNotifier, SerialEvent};
use crate::serial::{ConnectionOptions, ReadHandler, ReadSubscription, SerialTransport};

/// Owns the open/close lifecycle of the single serial connection
pub struct ConnectionController {
    transport: Arc<dyn SerialTransport>,
    notifier: Arc<EventNotifier>,
    state_tx: watch::Sender<ConnectionState>,
    connection_id: Option<String>,
    opened_at: Option<DateTime<Utc>>,
    subscription: Option<ReadSubscription>,
    // Never incremented; sends are reported through the callback only
    bytes_sent: u64,
    bytes_received: Arc<AtomicU64>,
}

impl ConnectionController {
    pub fn new(transport: Arc<dyn SerialTransport>, notifier: Arc<EventNotifier>) -> Self {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Closed);
        Self {
            transport,
            notifier,
            state_tx,
            connection_id: None,
            opened_at: None,
            subscription: None,
            bytes_sent: 0,
            bytes_received: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Follow state transitions, including the transient Opening/Closing
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.connection_id.is_some()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn has_read_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state(),
            is_open: self.is_open(),
            connection_id: self.connection_id.clone(),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            opened_at: self.opened_at,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("Connection state: {} -> {}", self.state(), state);
        self.state_tx.send_replace(state);
    }

    fn receive_handler(&self) -> ReadHandler {
        let received = self.bytes_received.clone();
        let notifier = self.notifier.clone();
        Arc::new(move |chunk: &[u8]| {
            received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            log::trace!("Received {} bytes: {}", chunk.len(), hex::encode(chunk));
            notifier.emit(SerialEvent::Receive(chunk.to_vec()));
        })
    }

    /// Open `path`. Transport failures come back as `Ok(false)`; only calling
    /// this outside `Closed` is an error.
    pub async fn connect(&mut self, path: &str, options: &ConnectionOptions) -> Result<bool> {
        let state = self.state();
        if state != ConnectionState::Closed {
            return Err(DeviceError::InvalidState { operation: "connect", state });
        }

        self.set_state(ConnectionState::Opening);
        log::info!("Attempting to connect to {} at {} baud", path, options.baud_rate);

        if let Err(e) = self.transport.open_connection(path, options).await {
            log::error!("Connection to {} failed: {}", path, e);
            self.set_state(ConnectionState::Closed);
            self.notifier.emit(SerialEvent::Connect(false));
            return Ok(false);
        }

        self.connection_id = Some(path.to_string());
        self.opened_at = Some(Utc::now());
        self.set_state(ConnectionState::Open);

        // A failed registration leaves the connection open without a receive path
        match self.transport.register_read_callback(self.receive_handler()).await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(e) => log::warn!("Failed to register receive callback on {}: {}", path, e),
        }

        log::info!("Connected to {}", path);
        self.notifier.emit(SerialEvent::Connect(true));
        Ok(true)
    }

    /// Write `data`. The callback always runs, with zero bytes on failure.
    pub async fn send(&mut self, data: &[u8], callback: Option<SendCallback>) -> bool {
        let (ok, bytes_sent) = if self.state() != ConnectionState::Open {
            log::warn!("Send of {} bytes attempted while connection is {}", data.len(), self.state());
            (false, 0)
        } else {
            match self.transport.write(data).await {
                Ok(written) => (true, written),
                Err(e) => {
                    log::warn!("Serial write failed: {}", e);
                    (false, 0)
                }
            }
        };

        if let Some(callback) = callback {
            callback(SendResult { bytes_sent });
        }
        ok
    }

    /// Release the receive subscription and close the port.
    ///
    /// State is reset and `Disconnect(true)` emitted even when the transport
    /// fails; the first failure is then returned as `DeviceError::SerialClose`.
    pub async fn disconnect(&mut self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::Open => {}
            state => return Err(DeviceError::InvalidState { operation: "disconnect", state }),
        }

        self.set_state(ConnectionState::Closing);
        let mut failure = None;

        if let Some(subscription) = self.subscription.take() {
            if let Err(e) = self.transport.unregister_read_callback(subscription).await {
                log::error!("Failed to unregister receive callback: {}", e);
                failure = Some(e);
            }
        }

        if let Err(e) = self.transport.close_connection().await {
            log::error!("Failed to close serial connection: {}", e);
            if failure.is_none() {
                failure = Some(e);
            }
        }

        let path = self.connection_id.take();
        self.opened_at = None;
        self.set_state(ConnectionState::Closed);
        log::info!("Disconnected from {}", path.as_deref().unwrap_or("<unknown>"));
        self.notifier.emit(SerialEvent::Disconnect(true));

        match failure {
            Some(source) => Err(DeviceError::SerialClose { source }),
            None => Ok(()),
        }
    }
}
