//! In-memory backend driven by hand.
//!
//! Nothing is observed from the filesystem: callers inject raw batches for
//! the directories the service registered. Useful wherever exact control
//! over event timing matters, such as debounce and race tests.

use super::{Backend, BatchQueue, RawBatch, RawEvent, RawKind, WatchHandle};
use crate::{Result, WatchError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct ManualState {
    by_dir: HashMap<PathBuf, WatchHandle>,
    by_handle: HashMap<WatchHandle, PathBuf>,
    /// Handles whose next re-arm fails
    dead: HashSet<WatchHandle>,
    /// Directories whose registration is refused
    refused: HashSet<PathBuf>,
    rearms: u64,
}

/// Backend whose events are injected programmatically.
pub struct ManualBackend {
    state: Mutex<ManualState>,
    queue: BatchQueue,
    next_id: AtomicU64,
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState::default()),
            queue: BatchQueue::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Handle currently watching `dir`, if any.
    pub fn handle_for(&self, dir: &Path) -> Option<WatchHandle> {
        self.state.lock().by_dir.get(dir).copied()
    }

    /// All directories with a live watch, sorted.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<_> = self.state.lock().by_dir.keys().cloned().collect();
        dirs.sort();
        dirs
    }

    /// Queue a batch of `(kind, child name)` events for the watch on `dir`.
    ///
    /// Returns false if `dir` is not watched.
    pub fn emit<'a, I>(&self, dir: &Path, events: I) -> bool
    where
        I: IntoIterator<Item = (RawKind, &'a str)>,
    {
        let Some(handle) = self.handle_for(dir) else {
            return false;
        };
        let events = events
            .into_iter()
            .map(|(kind, name)| RawEvent::new(kind, name))
            .collect();
        self.queue.push(RawBatch::new(handle, events));
        true
    }

    /// Queue an arbitrary batch, including ones for stale handles.
    pub fn emit_raw(&self, batch: RawBatch) {
        self.queue.push(batch);
    }

    /// Report dropped events for `dir`, or for the whole backend.
    pub fn emit_overflow(&self, dir: Option<&Path>) -> bool {
        match dir {
            Some(dir) => match self.handle_for(dir) {
                Some(handle) => {
                    self.queue
                        .push(RawBatch::new(handle, vec![RawEvent::overflow()]));
                    true
                }
                None => false,
            },
            None => {
                self.queue.push(RawBatch::global_overflow());
                true
            }
        }
    }

    /// Make the next re-arm of the watch on `dir` fail.
    pub fn invalidate(&self, dir: &Path) -> bool {
        let mut state = self.state.lock();
        match state.by_dir.get(dir).copied() {
            Some(handle) => state.dead.insert(handle),
            None => false,
        }
    }

    /// Refuse future registrations of `dir`.
    pub fn refuse(&self, dir: &Path) {
        self.state.lock().refused.insert(dir.to_path_buf());
    }

    /// Number of successful re-arms so far.
    pub fn rearm_count(&self) -> u64 {
        self.state.lock().rearms
    }
}

impl Backend for ManualBackend {
    fn watch(&self, dir: &Path) -> Result<WatchHandle> {
        if self.queue.is_closed() {
            return Err(WatchError::Closed);
        }
        let mut state = self.state.lock();
        if state.refused.contains(dir) {
            return Err(WatchError::backend(
                dir,
                notify::Error::generic("registration refused"),
            ));
        }
        if let Some(handle) = state.by_dir.get(dir) {
            return Ok(*handle);
        }

        let handle = WatchHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.by_dir.insert(dir.to_path_buf(), handle);
        state.by_handle.insert(handle, dir.to_path_buf());
        Ok(handle)
    }

    fn unwatch(&self, handle: WatchHandle) -> Result<()> {
        let mut state = self.state.lock();
        let dir = state
            .by_handle
            .remove(&handle)
            .ok_or(WatchError::HandleInvalid(handle))?;
        state.by_dir.remove(&dir);
        state.dead.remove(&handle);
        Ok(())
    }

    fn rearm(&self, handle: WatchHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.by_handle.contains_key(&handle) || state.dead.contains(&handle) {
            return Err(WatchError::HandleInvalid(handle));
        }
        state.rearms += 1;
        Ok(())
    }

    fn next_batch(&self) -> Option<RawBatch> {
        self.queue.next()
    }

    fn close(&self) {
        self.queue.close();
        let mut state = self.state.lock();
        state.by_dir.clear();
        state.by_handle.clear();
        state.dead.clear();
    }
}
