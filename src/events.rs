//! Listener registry shared by every authority.
//!
//! Each component owns one `EventHub` for its event enum. Callbacks registered with
//! [`EventHub::add_listener`] run synchronously after the triggering state change has been
//! stored; async consumers use [`EventHub::subscribe`] and receive the same events through a
//! broadcast channel.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

/// Callback invoked for every event emitted by a hub
pub trait Listener<E>: Send + Sync {
    fn on_event(&self, event: &E) -> anyhow::Result<()>;
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &E) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by `add_listener`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct EventHub<E> {
    name: &'static str,
    listeners: RwLock<Arc<Vec<(ListenerId, Arc<dyn Listener<E>>)>>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<E>,
}

impl<E: Clone + std::fmt::Debug> EventHub<E> {
    pub fn new(name: &'static str) -> Self {
        let (event_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            name,
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(0),
            event_tx,
        }
    }

    pub fn add_listener(&self, listener: impl Listener<E> + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write();
        let mut next = guard.as_ref().clone();
        next.push((id, Arc::new(listener)));
        *guard = Arc::new(next);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|(lid, _)| *lid == id) {
            return false;
        }
        let next: Vec<_> = guard.iter().filter(|(lid, _)| *lid != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Subscribe to events through a broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.event_tx.subscribe()
    }

    /// Deliver an event to every listener, then to broadcast subscribers.
    ///
    /// Must not be called while holding a record lock: listeners may call back into the
    /// component that emitted the event.
    pub fn emit(&self, event: E) {
        let snapshot = self.listeners.read().clone();

        for (id, listener) in snapshot.iter() {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(hub = self.name, listener = id.0, error = %e, ?event, "listener failed");
                }
                Err(_) => {
                    warn!(hub = self.name, listener = id.0, ?event, "listener panicked");
                }
            }
        }

        // No receivers is fine
        let _ = self.event_tx.send(event);
    }
}
