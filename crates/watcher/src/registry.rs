//! Watch registry: watched paths and the backend handles behind them
//!
//! Every registered path holds a reference on the backend watch of its parent
//! directory (so events about the path itself are seen) and, for directories,
//! on its own watch (so its children are seen). Backend watches are
//! reference-counted per directory and released when the last entry needing
//! them goes away.
//!
//! The forward map (path -> entry) and reverse map (handle -> directory) live
//! in one structure behind one reader/writer lock. Lookups from the dispatch
//! loop take the shared side; registration and removal take the exclusive
//! side.

use crate::backend::{Backend, WatchHandle};
use crate::debounce::Debouncer;
use crate::{EventKind, EventKinds};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// What a watched path wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub kinds: EventKinds,
    /// New subdirectories are watched automatically
    pub recursive: bool,
}

impl Interest {
    pub fn new(kinds: EventKinds, recursive: bool) -> Self {
        Self { kinds, recursive }
    }
}

/// One path under observation.
struct WatchedPath {
    parent: PathBuf,
    /// Still holds a reference on the parent's watch; cleared when that
    /// watch dies under a live entry
    watches_parent: bool,
    interest: Interest,
    /// Holds a reference on its own directory watch
    is_dir: bool,
    debounce: Mutex<Debouncer>,
}

struct DirWatch {
    handle: WatchHandle,
    refs: usize,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<PathBuf, WatchedPath>,
    dirs: HashMap<PathBuf, DirWatch>,
    handles: HashMap<WatchHandle, PathBuf>,
    closed: bool,
}

/// Result of resolving a raw event against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    /// Directory the backend handle watches
    pub dir: PathBuf,
    /// Absolute path the event is about
    pub target: PathBuf,
    /// Interest of the target's own entry, or else of its directory
    pub interest: Interest,
    /// Entry whose debounce table records events on the target: the
    /// directory when it is registered, otherwise the target itself
    pub holder: PathBuf,
    /// The target is itself a registered directory
    pub target_is_watched_dir: bool,
}

/// Thread-safe table of watched paths.
pub struct Registry {
    backend: Arc<dyn Backend>,
    tables: RwLock<Tables>,
    window: Duration,
}

impl Registry {
    pub fn new(backend: Arc<dyn Backend>, window: Duration) -> Self {
        Self {
            backend,
            tables: RwLock::new(Tables::default()),
            window,
        }
    }

    /// Register `path` with the given interest.
    ///
    /// Returns false if the path is already registered and
    /// `update_if_existing` is false, if it has no parent, if the backend
    /// refuses the watch, or if the registry has been closed.
    pub fn register(&self, path: &Path, interest: Interest, update_if_existing: bool) -> bool {
        let mut tables = self.tables.write();
        if tables.closed {
            debug!("registry closed, not registering {}", path.display());
            return false;
        }

        if let Some(entry) = tables.entries.get_mut(path) {
            if !update_if_existing {
                return false;
            }
            entry.interest = interest;
            return true;
        }

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => {
                warn!("cannot watch {}: no parent directory", path.display());
                return false;
            }
        };
        let is_dir = path.is_dir();

        if let Err(e) = self.acquire(&mut tables, &parent) {
            warn!("failed to watch {}: {}", parent.display(), e);
            return false;
        }
        if is_dir {
            if let Err(e) = self.acquire(&mut tables, path) {
                warn!("failed to watch {}: {}", path.display(), e);
                self.release(&mut tables, &parent);
                return false;
            }
        }

        debug!("registering {} in watcher service", path.display());
        tables.entries.insert(
            path.to_path_buf(),
            WatchedPath {
                parent,
                watches_parent: true,
                interest,
                is_dir,
                debounce: Mutex::new(Debouncer::new(self.window)),
            },
        );
        true
    }

    /// Drop the entry for `path`. Idempotent.
    pub fn remove(&self, path: &Path) -> bool {
        let mut tables = self.tables.write();
        self.remove_locked(&mut tables, path)
    }

    /// Drop `root` and every entry beneath it. Returns the removed paths.
    pub fn remove_tree(&self, root: &Path) -> Vec<PathBuf> {
        let mut tables = self.tables.write();
        self.remove_tree_locked(&mut tables, root)
    }

    /// Abandon the watch behind a dead handle.
    ///
    /// A registered directory is dropped along with everything under it. A
    /// parent-only watch (the parent of a root) is released on its own: the
    /// roots inside it keep their entries and their own watches.
    pub fn abandon(&self, handle: WatchHandle) -> Vec<PathBuf> {
        let mut tables = self.tables.write();
        let Some(dir) = tables.handles.get(&handle).cloned() else {
            return Vec::new();
        };
        if tables.entries.contains_key(&dir) {
            return self.remove_tree_locked(&mut tables, &dir);
        }

        for entry in tables.entries.values_mut() {
            if entry.parent == dir {
                entry.watches_parent = false;
            }
        }
        if let Some(watch) = tables.dirs.remove(&dir) {
            tables.handles.remove(&watch.handle);
            if let Err(e) = self.backend.unwatch(watch.handle) {
                debug!("unwatch dead watch on {}: {}", dir.display(), e);
            }
        }
        Vec::new()
    }

    /// Directory watched by `handle`.
    pub fn resolve(&self, handle: WatchHandle) -> Option<PathBuf> {
        self.tables.read().handles.get(&handle).cloned()
    }

    /// Resolve a raw event for `handle` about child `name`.
    ///
    /// Returns `None` when no registered path cares about it.
    pub fn lookup(&self, handle: WatchHandle, name: &OsStr) -> Option<Lookup> {
        let tables = self.tables.read();
        let dir = tables.handles.get(&handle)?;
        let target = dir.join(name);

        let own = tables.entries.get(&target);
        let parent = tables.entries.get(dir.as_path());
        let interest = own.or(parent)?.interest;
        let holder = if parent.is_some() {
            dir.clone()
        } else {
            target.clone()
        };

        Some(Lookup {
            dir: dir.clone(),
            interest,
            holder,
            target_is_watched_dir: own.map(|e| e.is_dir).unwrap_or(false),
            target,
        })
    }

    /// Run the holder's debounce check for an event on `target`.
    ///
    /// Returns false if the event is suppressed or the holder is gone.
    pub fn admit(&self, holder: &Path, target: &Path, kind: EventKind, now: Instant) -> bool {
        let tables = self.tables.read();
        match tables.entries.get(holder) {
            Some(entry) => entry.debounce.lock().admit(target, kind, now),
            None => false,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.tables.read().entries.contains_key(path)
    }

    pub fn interest(&self, path: &Path) -> Option<Interest> {
        self.tables.read().entries.get(path).map(|e| e.interest)
    }

    pub fn handle_of(&self, dir: &Path) -> Option<WatchHandle> {
        self.tables.read().dirs.get(dir).map(|w| w.handle)
    }

    /// Registered paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.tables.read().entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.tables.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live backend watches.
    pub fn watch_count(&self) -> usize {
        self.tables.read().dirs.len()
    }

    pub fn is_closed(&self) -> bool {
        self.tables.read().closed
    }

    /// Release every backend watch and refuse further registrations.
    ///
    /// A failure to release one watch is logged and does not stop the rest.
    pub fn close(&self) {
        let mut tables = self.tables.write();
        if tables.closed {
            return;
        }
        tables.closed = true;
        tables.entries.clear();
        tables.handles.clear();

        for (dir, watch) in tables.dirs.drain() {
            if let Err(e) = self.backend.unwatch(watch.handle) {
                error!("failed to release watch on {}: {}", dir.display(), e);
            }
        }
    }

    fn acquire(&self, tables: &mut Tables, dir: &Path) -> crate::Result<WatchHandle> {
        if let Some(watch) = tables.dirs.get_mut(dir) {
            watch.refs += 1;
            return Ok(watch.handle);
        }

        let handle = self.backend.watch(dir)?;
        tables.dirs.insert(dir.to_path_buf(), DirWatch { handle, refs: 1 });
        tables.handles.insert(handle, dir.to_path_buf());
        Ok(handle)
    }

    fn release(&self, tables: &mut Tables, dir: &Path) {
        let Some(watch) = tables.dirs.get_mut(dir) else {
            return;
        };
        watch.refs -= 1;
        if watch.refs > 0 {
            return;
        }

        let handle = watch.handle;
        tables.dirs.remove(dir);
        tables.handles.remove(&handle);
        if let Err(e) = self.backend.unwatch(handle) {
            // Watches on deleted directories are usually gone already.
            if dir.exists() {
                warn!("failed to unwatch {}: {}", dir.display(), e);
            } else {
                debug!("unwatch {} after deletion: {}", dir.display(), e);
            }
        }
    }

    fn remove_locked(&self, tables: &mut Tables, path: &Path) -> bool {
        let Some(entry) = tables.entries.remove(path) else {
            return false;
        };
        if entry.is_dir {
            self.release(tables, path);
        }
        if entry.watches_parent {
            self.release(tables, &entry.parent);
        }
        debug!("removed {} from watcher service", path.display());
        true
    }

    fn remove_tree_locked(&self, tables: &mut Tables, root: &Path) -> Vec<PathBuf> {
        let mut doomed: Vec<PathBuf> = tables
            .entries
            .keys()
            .filter(|p| p.starts_with(root))
            .cloned()
            .collect();
        // Deepest first so child watches go before their parents.
        doomed.sort_by(|a, b| b.components().count().cmp(&a.components().count()));

        doomed
            .into_iter()
            .filter(|p| self.remove_locked(tables, p))
            .collect()
    }
}
