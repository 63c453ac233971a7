use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Callback invoked with every chunk the transport receives
pub type ReadHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Live registration of a receive handler with a transport.
///
/// Cancelling (or dropping) the subscription stops delivery. A subscription
/// is cancelled at most once.
pub struct ReadSubscription {
    id: Uuid,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ReadSubscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ReadSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ReadSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSubscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
