//! In-memory transport for tests and host-side simulation.
//!
//! Every call is counted, every failure can be injected, and received data
//! is pushed in by hand with [`MockTransport::push_received`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use async_trait::async_trait;

use super::{
    ConnectionOptions, PermissionRequest, PermissionResponse, ReadHandler, ReadSubscription,
    Result, SerialError, SerialTransport,
};

#[derive(Default)]
struct Counters {
    permission_requests: AtomicUsize,
    opens: AtomicUsize,
    writes: AtomicUsize,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
    closes: AtomicUsize,
}

#[derive(Default)]
struct Failures {
    open: AtomicBool,
    write: AtomicBool,
    register: AtomicBool,
    unregister: AtomicBool,
    close: AtomicBool,
}

#[derive(Default)]
pub struct MockTransport {
    granted: Mutex<HashSet<(u16, u16)>>,
    denied: Mutex<HashSet<(u16, u16)>>,
    permission_log: Mutex<Vec<PermissionRequest>>,
    open: AtomicBool,
    last_open: Mutex<Option<(String, ConnectionOptions)>>,
    written: Mutex<Vec<Vec<u8>>>,
    handler: Arc<Mutex<Option<ReadHandler>>>,
    counters: Counters,
    failures: Failures,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer permission requests for the pair with `granted: true`
    pub fn grant(&self, vendor_id: u16, product_id: u16) {
        lock(&self.granted).insert((vendor_id, product_id));
    }

    /// Answer permission requests for the pair with `granted: false`.
    /// Pairs neither granted nor denied make the request fail outright.
    pub fn deny(&self, vendor_id: u16, product_id: u16) {
        lock(&self.denied).insert((vendor_id, product_id));
    }

    pub fn fail_open(&self, fail: bool) {
        self.failures.open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_write(&self, fail: bool) {
        self.failures.write.store(fail, Ordering::SeqCst);
    }

    pub fn fail_register(&self, fail: bool) {
        self.failures.register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unregister(&self, fail: bool) {
        self.failures.unregister.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.failures.close.store(fail, Ordering::SeqCst);
    }

    /// Deliver a received chunk to the registered handler.
    /// Returns false when nothing is registered.
    pub fn push_received(&self, data: &[u8]) -> bool {
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn has_read_callback(&self) -> bool {
        lock(&self.handler).is_some()
    }

    pub fn last_open(&self) -> Option<(String, ConnectionOptions)> {
        lock(&self.last_open).clone()
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }

    pub fn permission_log(&self) -> Vec<PermissionRequest> {
        lock(&self.permission_log).clone()
    }

    pub fn permission_request_count(&self) -> usize {
        self.counters.permission_requests.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.counters.writes.load(Ordering::SeqCst)
    }

    pub fn register_count(&self) -> usize {
        self.counters.registrations.load(Ordering::SeqCst)
    }

    pub fn unregister_count(&self) -> usize {
        self.counters.unregistrations.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected(operation: &str) -> SerialError {
    SerialError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("injected {} failure", operation),
    ))
}

#[async_trait]
impl SerialTransport for MockTransport {
    async fn request_serial_permissions(&self, request: PermissionRequest) -> Result<PermissionResponse> {
        self.counters.permission_requests.fetch_add(1, Ordering::SeqCst);
        let pair = (request.vendor_id, request.product_id);
        lock(&self.permission_log).push(request);

        if lock(&self.granted).contains(&pair) {
            Ok(PermissionResponse { granted: true })
        } else if lock(&self.denied).contains(&pair) {
            Ok(PermissionResponse { granted: false })
        } else {
            Err(SerialError::PermissionDenied {
                vendor_id: pair.0,
                product_id: pair.1,
            })
        }
    }

    async fn open_connection(&self, path: &str, options: &ConnectionOptions) -> Result<()> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.failures.open.load(Ordering::SeqCst) {
            return Err(SerialError::ConnectionFailed(format!("injected open failure on {}", path)));
        }
        *lock(&self.last_open) = Some((path.to_string(), options.clone()));
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        if self.failures.write.load(Ordering::SeqCst) {
            return Err(injected("write"));
        }
        if !self.is_open() {
            return Err(SerialError::NotConnected);
        }
        lock(&self.written).push(data.to_vec());
        Ok(data.len())
    }

    async fn register_read_callback(&self, handler: ReadHandler) -> Result<ReadSubscription> {
        self.counters.registrations.fetch_add(1, Ordering::SeqCst);
        if self.failures.register.load(Ordering::SeqCst) {
            return Err(injected("register"));
        }
        *lock(&self.handler) = Some(handler);

        let slot = self.handler.clone();
        Ok(ReadSubscription::new(move || {
            lock(&slot).take();
        }))
    }

    async fn unregister_read_callback(&self, mut subscription: ReadSubscription) -> Result<()> {
        self.counters.unregistrations.fetch_add(1, Ordering::SeqCst);
        if self.failures.unregister.load(Ordering::SeqCst) {
            return Err(injected("unregister"));
        }
        subscription.cancel();
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.failures.close.load(Ordering::SeqCst) {
            return Err(injected("close"));
        }
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
