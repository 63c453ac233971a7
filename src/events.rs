//! Typed publish/subscribe channel for device and connection notifications.
//!
//! Delivery is synchronous and in-process: `emit` calls every listener for
//! the event's kind, in subscription order, before returning.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::device::PortDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    AddedDevice,
    RemovedDevice,
    Connect,
    Disconnect,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum SerialEvent {
    AddedDevice(PortDescriptor),
    RemovedDevice(PortDescriptor),
    /// Outcome of a connect attempt
    Connect(bool),
    /// Always `true` when emitted
    Disconnect(bool),
    Receive(Vec<u8>),
}

impl SerialEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SerialEvent::AddedDevice(_) => EventKind::AddedDevice,
            SerialEvent::RemovedDevice(_) => EventKind::RemovedDevice,
            SerialEvent::Connect(_) => EventKind::Connect,
            SerialEvent::Disconnect(_) => EventKind::Disconnect,
            SerialEvent::Receive(_) => EventKind::Receive,
        }
    }
}

pub type Listener = Arc<dyn Fn(&SerialEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

#[derive(Default)]
pub struct EventNotifier {
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        listeners.entry(kind).or_default().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the listener was not subscribed
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(entry_id, _)| *entry_id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        let listeners = self.listeners.read().unwrap_or_else(|p| p.into_inner());
        listeners.get(&kind).map_or(0, Vec::len)
    }

    pub fn emit(&self, event: SerialEvent) {
        // Snapshot so listeners may subscribe or unsubscribe while being notified
        let targets: Vec<Listener> = {
            let listeners = self.listeners.read().unwrap_or_else(|p| p.into_inner());
            listeners
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        log::trace!("Emitting {:?} to {} listener(s)", event.kind(), targets.len());
        for listener in targets {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_only_matching_kind() {
        let notifier = EventNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        notifier.subscribe(EventKind::Connect, move |e| sink.lock().unwrap().push(e.clone()));

        notifier.emit(SerialEvent::Disconnect(true));
        notifier.emit(SerialEvent::Connect(false));

        assert_eq!(*seen.lock().unwrap(), vec![SerialEvent::Connect(false)]);
    }

    #[test]
    fn test_multiple_listeners_in_subscription_order() {
        let notifier = EventNotifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            notifier.subscribe(EventKind::Receive, move |_| order.lock().unwrap().push(tag));
        }
        notifier.emit(SerialEvent::Receive(vec![1, 2, 3]));

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(notifier.listener_count(EventKind::Receive), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let notifier = EventNotifier::new();
        let hits = Arc::new(Mutex::new(0));

        let counter = hits.clone();
        let id = notifier.subscribe(EventKind::Disconnect, move |_| *counter.lock().unwrap() += 1);

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.emit(SerialEvent::Disconnect(true));

        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_listener_can_subscribe_during_emit() {
        let notifier = Arc::new(EventNotifier::new());
        let inner = notifier.clone();
        notifier.subscribe(EventKind::Connect, move |_| {
            inner.subscribe(EventKind::Connect, |_| {});
        });

        notifier.emit(SerialEvent::Connect(true));
        assert_eq!(notifier.listener_count(EventKind::Connect), 2);
    }
}
