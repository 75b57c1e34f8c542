//! Dispatch loop
//!
//! One background thread pulls raw batches from the backend, resolves them
//! against the registry, expands new directories, debounces and fans the
//! surviving events out to listeners. The blocking read on the backend is
//! the only suspension point; closing the backend wakes it.

use crate::backend::{RawBatch, RawKind, WatchHandle};
use crate::registry::{Interest, Lookup};
use crate::service::Shared;
use crate::walker::TreeWalker;
use crate::{EventKind, WatchError};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Lifecycle of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Stopped = 0,
    Running = 1,
    Closing = 2,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoopState::Running,
            2 => LoopState::Closing,
            _ => LoopState::Stopped,
        }
    }
}

/// Atomic cell holding a [`LoopState`].
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU8::new(LoopState::Stopped as u8))
    }

    pub(crate) fn get(&self) -> LoopState {
        LoopState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: LoopState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to`; false if the state was something else.
    pub(crate) fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Counters snapshot returned by [`WatchService::stats`](crate::WatchService::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Events handed to listeners
    pub delivered: u64,
    /// Events dropped by the coalescing window
    pub suppressed: u64,
    /// Events nobody was interested in, or that raced a removal
    pub discarded: u64,
    /// Dropped-event signals from the backend
    pub overflows: u64,
    /// Watches lost because they could not be re-armed
    pub rearm_failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    delivered: AtomicU64,
    suppressed: AtomicU64,
    discarded: AtomicU64,
    overflows: AtomicU64,
    rearm_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WatchStats {
        WatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            rearm_failures: self.rearm_failures.load(Ordering::Relaxed),
        }
    }
}

/// Body of the dispatch thread.
pub(crate) fn run(shared: Arc<Shared>) {
    info!("dispatch loop started");

    while shared.state.get() == LoopState::Running {
        let Some(batch) = shared.backend.next_batch() else {
            break;
        };
        if shared.state.get() != LoopState::Running {
            break;
        }
        process_batch(&shared, batch);
    }

    shared.state.set(LoopState::Stopped);
    info!("dispatch loop stopped");
}

fn process_batch(shared: &Shared, batch: RawBatch) {
    let Some(handle) = batch.handle else {
        handle_overflow(shared, None);
        return;
    };
    let Some(dir) = shared.registry.resolve(handle) else {
        debug!("batch for unknown watch {}, discarding", handle);
        for _ in &batch.events {
            Counters::bump(&shared.stats.discarded);
        }
        return;
    };

    for raw in batch.events {
        let kind = match raw.kind {
            RawKind::Overflow => {
                handle_overflow(shared, Some(&dir));
                continue;
            }
            RawKind::Created => EventKind::Created,
            RawKind::Modified => EventKind::Modified,
            RawKind::Deleted => EventKind::Deleted,
        };
        match raw.name {
            Some(name) => process_event(shared, handle, kind, &name),
            None => Counters::bump(&shared.stats.discarded),
        }
    }

    // Nothing to re-arm if this batch removed the watch itself.
    if shared.registry.resolve(handle).is_none() {
        return;
    }
    let Err(e) = shared.backend.rearm(handle) else {
        return;
    };
    if !dir.is_dir() {
        // Removed together with its parent; the parent's Deleted event may
        // not have been processed yet.
        let removed = shared.registry.remove_tree(&dir);
        prune_roots(shared);
        debug!(
            "watched directory {} is gone, dropped {} watched path(s)",
            dir.display(),
            removed.len()
        );
        return;
    }

    Counters::bump(&shared.stats.rearm_failures);
    let dropped = shared.registry.abandon(handle);
    prune_roots(shared);
    warn!(
        "failed to re-arm watch on {}: {}; dropped {} watched path(s)",
        dir.display(),
        e,
        dropped.len()
    );
}

/// Forget roots whose entries are gone from the registry.
fn prune_roots(shared: &Shared) {
    shared
        .roots
        .write()
        .retain(|root, _| shared.registry.contains(root));
}

fn process_event(shared: &Shared, handle: WatchHandle, kind: EventKind, name: &OsStr) {
    let Some(hit) = shared.registry.lookup(handle, name) else {
        // Unregistered sibling, or the entry was removed in the meantime.
        trace!("no watched path for {:?} in {}", name, handle);
        Counters::bump(&shared.stats.discarded);
        return;
    };

    let is_dir =
        hit.target_is_watched_dir || (kind != EventKind::Deleted && hit.target.is_dir());
    if shared.ignore.should_ignore(&hit.target, is_dir) {
        Counters::bump(&shared.stats.discarded);
        return;
    }

    deliver(shared, &hit.holder, &hit.target, kind, hit.interest);

    match kind {
        EventKind::Deleted if hit.target_is_watched_dir => forget_directory(shared, &hit),
        EventKind::Created | EventKind::Modified
            if is_dir && !hit.target_is_watched_dir && hit.interest.recursive =>
        {
            expand(shared, &hit.target, hit.interest)
        }
        _ => {}
    }
}

/// Debounce and fan out one event.
fn deliver(shared: &Shared, holder: &Path, target: &Path, kind: EventKind, interest: Interest) {
    if !interest.kinds.contains(kind) {
        Counters::bump(&shared.stats.discarded);
        return;
    }
    if !shared.registry.admit(holder, target, kind, Instant::now()) {
        trace!("debounced {} {}", kind, target.display());
        Counters::bump(&shared.stats.suppressed);
        return;
    }

    debug!("detected {} event at {}", kind, target.display());
    shared.listeners.fire(target, kind);
    Counters::bump(&shared.stats.delivered);
}

fn forget_directory(shared: &Shared, hit: &Lookup) {
    let removed = shared.registry.remove_tree(&hit.target);
    prune_roots(shared);
    debug!(
        "directory {} deleted, dropped {} watched path(s)",
        hit.target.display(),
        removed.len()
    );
}

/// Watch a directory that appeared under a recursive watch, and announce
/// what it already contains: those entries were created before any watch
/// could see them.
fn expand(shared: &Shared, dir: &Path, interest: Interest) {
    let walker = TreeWalker::new(&shared.registry, &shared.ignore)
        .follow_links(shared.config.follow_links)
        .collect_entries(true);

    let summary = match walker.walk(dir, interest) {
        Ok(summary) => summary,
        Err(e @ (WatchError::NotFound(_) | WatchError::NotADirectory(_))) => {
            debug!("new directory gone before it could be watched: {}", e);
            return;
        }
        Err(e) => {
            warn!("failed to watch new directory {}: {}", dir.display(), e);
            return;
        }
    };
    debug!(
        "watching new directory {} ({} directories)",
        dir.display(),
        summary.registered.len()
    );

    for path in summary.discovered {
        let Some(parent) = path.parent() else {
            continue;
        };
        deliver(shared, parent, &path, EventKind::Created, interest);
    }
}

/// Report dropped events and, if configured, re-walk to restore coverage.
fn handle_overflow(shared: &Shared, dir: Option<&Path>) {
    Counters::bump(&shared.stats.overflows);
    match dir {
        Some(dir) => warn!("event overflow in {}, some events were lost", dir.display()),
        None => warn!("event overflow, some events were lost"),
    }

    if !shared.config.rewalk_on_overflow {
        return;
    }

    let targets: Vec<(PathBuf, Interest)> = match dir {
        Some(dir) => shared
            .registry
            .interest(dir)
            .filter(|i| i.recursive)
            .map(|i| vec![(dir.to_path_buf(), i)])
            .unwrap_or_default(),
        None => shared
            .roots
            .read()
            .iter()
            .filter(|(_, i)| i.recursive)
            .map(|(p, i)| (p.clone(), *i))
            .collect(),
    };

    let walker = TreeWalker::new(&shared.registry, &shared.ignore)
        .follow_links(shared.config.follow_links);
    for (root, interest) in targets {
        match walker.walk(&root, interest) {
            Ok(summary) => info!(
                "re-walked {} after overflow, {} new directories",
                root.display(),
                summary.registered.len()
            ),
            Err(e) => warn!("re-walk of {} failed: {}", root.display(), e),
        }
    }
}
