//! Event infrastructure for the connection layer.
//!
//! `ConnectionManagerEvent` is what the layer above observes; `EventBus`
//! fans events out to subscribers that unsubscribe on drop.

use crate::peer_descriptor::PeerDescriptor;
use crate::protocol::{DisconnectMode, Message};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// How a connected peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectionType {
    /// Announced with a disconnect notice, in either direction.
    Graceful(DisconnectMode),
    /// The transport closed without a notice.
    Transport { graceful_leave: bool },
}

/// Events surfaced by a `ConnectionManager`.
#[derive(Debug, Clone)]
pub enum ConnectionManagerEvent {
    /// Handshake completed with a peer.
    Connected(PeerDescriptor),
    /// A previously connected peer is gone.
    Disconnected(PeerDescriptor, DisconnectionType),
    /// Application message from a peer.
    Message(Message),
    /// Background failure not tied to a caller's own operation.
    Error(String),
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in a multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    bus.unsubscribe(id);
                }
            })),
        }
    }

    fn unsubscribe(&self, id: usize) {
        // emit releases the read lock before running callbacks, so this never
        // waits on a callback.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the list so callbacks may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = seen.clone();
        let _a = bus.subscribe(move |n| seen_a.lock().unwrap().push(("a", n)));
        let seen_b = seen.clone();
        let _b = bus.subscribe(move |n| seen_b.lock().unwrap().push(("b", n)));

        bus.emit(7);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let subscription = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(1);
        drop(subscription);
        bus.emit(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_waits_for_concurrent_reader() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let subscription = bus.subscribe(|_| {});

        let reader = bus.callbacks.read().unwrap();
        let dropper = std::thread::spawn(move || drop(subscription));
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(reader);
        dropper.join().unwrap();

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe_from_own_callback() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let counter = count.clone();
        let own = slot.clone();
        let subscription = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            own.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(subscription);

        bus.emit(1);
        bus.emit(2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let subscription = bus.subscribe(|_| {});
        drop(bus);
        drop(subscription);
    }

    #[test]
    fn test_subscribe_from_callback() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let inner_bus = bus.clone();
        let nested = Arc::new(Mutex::new(Vec::new()));
        let nested_clone = nested.clone();
        let _outer = bus.subscribe(move |_| {
            let subscription = inner_bus.subscribe(|_| {});
            nested_clone.lock().unwrap().push(subscription);
        });

        bus.emit(1);
        assert_eq!(bus.subscriber_count(), 2);
    }
}
