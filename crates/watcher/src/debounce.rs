//! Per-path debouncing logic
//!
//! Native backends commonly report one logical write as several Modified
//! events. A repeat of the last delivered kind for a path is dropped while it
//! falls inside the coalescing window.

use crate::EventKind;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Prune stale fingerprints once the table grows past this many paths.
const PRUNE_THRESHOLD: usize = 256;

/// Last delivered event for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub kind: EventKind,
    pub at: Instant,
}

/// Debounce table for the paths owned by one watched entry.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: HashMap<PathBuf, Fingerprint>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Decide whether an event should be delivered, recording it if so.
    pub fn admit(&mut self, path: &Path, kind: EventKind, now: Instant) -> bool {
        if let Some(last) = self.last.get(path) {
            if last.kind == kind && now.saturating_duration_since(last.at) <= self.window {
                return false;
            }
        }

        if self.last.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            self.last
                .retain(|_, f| now.saturating_duration_since(f.at) <= window);
        }
        self.last.insert(path.to_path_buf(), Fingerprint { kind, at: now });
        true
    }

    pub fn last(&self, path: &Path) -> Option<Fingerprint> {
        self.last.get(path).copied()
    }

    pub fn forget(&mut self, path: &Path) {
        self.last.remove(path);
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
