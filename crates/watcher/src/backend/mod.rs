//! Watch backend adapters
//!
//! A backend registers single directories (never recursively) and hands out
//! opaque [`WatchHandle`]s. The dispatch loop blocks in
//! [`Backend::next_batch`] until a batch of raw events for one handle is
//! available or the backend is closed.
//!
//! - [`NotifyBackend`]: the host's native notification API via `notify`
//! - [`ManualBackend`]: in-memory backend whose batches are injected by hand

mod manual;
mod native;

pub use manual::ManualBackend;
pub use native::NotifyBackend;

use crate::Result;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Opaque token for one backend-level directory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub(crate) fn new(id: u64) -> Self {
        WatchHandle(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw change kind as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Deleted,
    /// Events were dropped; the stream is unreliable for this directory.
    Overflow,
}

/// One raw event, relative to the directory its batch's handle watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawKind,
    /// Child name inside the watched directory. `None` only for overflow.
    pub name: Option<OsString>,
}

impl RawEvent {
    pub fn new(kind: RawKind, name: impl Into<OsString>) -> Self {
        Self {
            kind,
            name: Some(name.into()),
        }
    }

    pub fn overflow() -> Self {
        Self {
            kind: RawKind::Overflow,
            name: None,
        }
    }
}

/// Events pulled from the backend in one blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    /// Handle the events belong to. `None` means the backend as a whole
    /// overflowed and cannot say which directory lost events.
    pub handle: Option<WatchHandle>,
    pub events: Vec<RawEvent>,
}

impl RawBatch {
    pub fn new(handle: WatchHandle, events: Vec<RawEvent>) -> Self {
        Self {
            handle: Some(handle),
            events,
        }
    }

    pub fn global_overflow() -> Self {
        Self {
            handle: None,
            events: vec![RawEvent::overflow()],
        }
    }
}

/// Native directory-change notification primitive.
pub trait Backend: Send + Sync {
    /// Start watching `dir` (non-recursively) for create/modify/delete.
    fn watch(&self, dir: &Path) -> Result<WatchHandle>;

    /// Stop watching the directory behind `handle`.
    fn unwatch(&self, handle: WatchHandle) -> Result<()>;

    /// Re-arm `handle` after its batch has been processed. An error means the
    /// watch is dead and will produce no further events.
    fn rearm(&self, handle: WatchHandle) -> Result<()>;

    /// Block until the next batch is available. Returns `None` once the
    /// backend has been closed, even if batches are still queued.
    fn next_batch(&self) -> Option<RawBatch>;

    /// Release the native resources and wake any blocked `next_batch`.
    fn close(&self);
}

/// Blocking batch queue with an out-of-band close signal.
pub(crate) struct BatchQueue {
    tx: Sender<RawBatch>,
    rx: Receiver<RawBatch>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    closed: AtomicBool,
}

impl BatchQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        Self {
            tx,
            rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn sender(&self) -> Sender<RawBatch> {
        self.tx.clone()
    }

    pub(crate) fn push(&self, batch: RawBatch) {
        if !self.is_closed() {
            // The receiver lives in self, so send cannot fail here.
            let _ = self.tx.send(batch);
        }
    }

    pub(crate) fn next(&self) -> Option<RawBatch> {
        if self.is_closed() {
            return None;
        }
        select! {
            recv(self.rx) -> batch => batch.ok(),
            // Dropping the stop sender disconnects this arm.
            recv(self.stop_rx) -> _ => None,
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_tx.lock().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
