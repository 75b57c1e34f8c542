//! Listener registry
//!
//! Listeners are called synchronously on the dispatch thread, in the order
//! they were added. There is no timeout: a slow listener holds up every
//! event behind it, so listeners must return promptly and hand heavy work to
//! their own threads.
//!
//! Each delivery iterates an immutable snapshot of the listener list.
//! Listeners added during a delivery see events from the next delivery on;
//! once `remove` returns, no delivery that starts afterwards reaches the
//! removed listener.

use crate::EventKind;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

/// Receives change notifications.
pub trait Listener: Send + Sync {
    fn on_event(&self, path: &Path, kind: EventKind);
}

impl<F> Listener for F
where
    F: Fn(&Path, EventKind) + Send + Sync,
{
    fn on_event(&self, path: &Path, kind: EventKind) {
        self(path, kind)
    }
}

/// Token returned by [`ListenerSet::add`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Snapshot = Arc<Vec<(ListenerId, Arc<dyn Listener>)>>;

/// Ordered, copy-on-write set of listeners.
pub struct ListenerSet {
    listeners: RwLock<Snapshot>,
    next_id: AtomicU64,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.listeners.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|(lid, _)| *lid == id) {
            return false;
        }
        let next = guard.iter().filter(|(lid, _)| *lid != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one event to every listener. No lock is held while
    /// listeners run, so they may call back into the service.
    ///
    /// Returns the number of listeners reached.
    pub fn fire(&self, path: &Path, kind: EventKind) -> usize {
        let snapshot = Arc::clone(&self.listeners.read());
        for (id, listener) in snapshot.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(path, kind)));
            if outcome.is_err() {
                error!("listener {:?} panicked on {} {}", id, kind, path.display());
            }
        }
        snapshot.len()
    }
}
