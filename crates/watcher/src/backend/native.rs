//! Native backend built on `notify`.
//!
//! Each registered directory is watched with `RecursiveMode::NonRecursive`;
//! recursion is handled by the service. Incoming events carry absolute
//! paths, which are mapped back to the handle of their parent directory.

use super::{Backend, BatchQueue, RawBatch, RawEvent, RawKind, WatchHandle};
use crate::{Result, WatchError};
use crossbeam_channel::Sender;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct HandleTable {
    by_dir: HashMap<PathBuf, WatchHandle>,
    by_handle: HashMap<WatchHandle, PathBuf>,
}

impl HandleTable {
    fn insert(&mut self, dir: PathBuf, handle: WatchHandle) {
        self.by_dir.insert(dir.clone(), handle);
        self.by_handle.insert(handle, dir);
    }

    fn remove(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let dir = self.by_handle.remove(&handle)?;
        self.by_dir.remove(&dir);
        Some(dir)
    }

    /// Handle of the directory containing `path`, plus the child name.
    fn owner(&self, path: &Path) -> Option<(WatchHandle, RawEvent)> {
        let parent = path.parent()?;
        let name = path.file_name()?;
        let handle = self.by_dir.get(parent)?;
        Some((*handle, RawEvent::new(RawKind::Created, name)))
    }
}

/// Backend over the platform's recommended `notify` watcher.
pub struct NotifyBackend {
    watcher: Mutex<Option<RecommendedWatcher>>,
    table: Arc<RwLock<HandleTable>>,
    queue: BatchQueue,
    next_id: AtomicU64,
}

impl NotifyBackend {
    /// Creates the native notification channel.
    pub fn new() -> Result<Self> {
        let table = Arc::new(RwLock::new(HandleTable::default()));
        let queue = BatchQueue::new();

        let handler_table = Arc::clone(&table);
        let tx = queue.sender();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => forward(&event, &handler_table.read(), &tx),
            Err(e) => warn!("Watch error: {}", e),
        })
        .map_err(|e| WatchError::backend(PathBuf::new(), e))?;

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            table,
            queue,
            next_id: AtomicU64::new(1),
        })
    }
}

impl Backend for NotifyBackend {
    fn watch(&self, dir: &Path) -> Result<WatchHandle> {
        let mut guard = self.watcher.lock();
        let watcher = guard.as_mut().ok_or(WatchError::Closed)?;

        if let Some(handle) = self.table.read().by_dir.get(dir) {
            return Ok(*handle);
        }

        // Map first so events racing the registration are not dropped.
        let handle = WatchHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.table.write().insert(dir.to_path_buf(), handle);

        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            self.table.write().remove(handle);
            return Err(WatchError::backend(dir, e));
        }

        debug!("native watch {} on {}", handle, dir.display());
        Ok(handle)
    }

    fn unwatch(&self, handle: WatchHandle) -> Result<()> {
        let dir = self
            .table
            .write()
            .remove(handle)
            .ok_or(WatchError::HandleInvalid(handle))?;

        let mut guard = self.watcher.lock();
        match guard.as_mut() {
            Some(watcher) => watcher
                .unwatch(&dir)
                .map_err(|e| WatchError::backend(&dir, e)),
            None => Ok(()),
        }
    }

    fn rearm(&self, handle: WatchHandle) -> Result<()> {
        let table = self.table.read();
        match table.by_handle.get(&handle) {
            Some(dir) if dir.is_dir() => Ok(()),
            _ => Err(WatchError::HandleInvalid(handle)),
        }
    }

    fn next_batch(&self) -> Option<RawBatch> {
        self.queue.next()
    }

    fn close(&self) {
        self.queue.close();
        let watcher = self.watcher.lock().take();
        drop(watcher);
        let mut table = self.table.write();
        table.by_dir.clear();
        table.by_handle.clear();
    }
}

/// Translate one `notify` event into per-handle batches and queue them.
fn forward(event: &Event, table: &HandleTable, tx: &Sender<RawBatch>) {
    for batch in translate(event, table) {
        let _ = tx.send(batch);
    }
}

fn translate(event: &Event, table: &HandleTable) -> Vec<RawBatch> {
    if event.need_rescan() {
        return overflow_batches(event, table);
    }

    let mut changes: Vec<(RawKind, &Path)> = Vec::new();
    match &event.kind {
        EventKind::Create(_) => {
            changes.extend(event.paths.iter().map(|p| (RawKind::Created, p.as_path())));
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                changes.extend(event.paths.iter().map(|p| (RawKind::Deleted, p.as_path())));
            }
            RenameMode::To => {
                changes.extend(event.paths.iter().map(|p| (RawKind::Created, p.as_path())));
            }
            // Linux reports From and To separately as well; skip the pair.
            RenameMode::Both => {}
            _ => {
                for path in &event.paths {
                    let kind = if path.exists() {
                        RawKind::Created
                    } else {
                        RawKind::Deleted
                    };
                    changes.push((kind, path.as_path()));
                }
            }
        },
        EventKind::Modify(_) => {
            changes.extend(event.paths.iter().map(|p| (RawKind::Modified, p.as_path())));
        }
        EventKind::Remove(_) => {
            changes.extend(event.paths.iter().map(|p| (RawKind::Deleted, p.as_path())));
        }
        _ => {}
    }

    let mut grouped: BTreeMap<WatchHandle, Vec<RawEvent>> = BTreeMap::new();
    for (kind, path) in changes {
        match table.owner(path) {
            Some((handle, mut raw)) => {
                raw.kind = kind;
                grouped.entry(handle).or_default().push(raw);
            }
            None => debug!("no watch owns {}", path.display()),
        }
    }

    grouped
        .into_iter()
        .map(|(handle, events)| RawBatch::new(handle, events))
        .collect()
}

fn overflow_batches(event: &Event, table: &HandleTable) -> Vec<RawBatch> {
    let mut handles: Vec<WatchHandle> = event
        .paths
        .iter()
        .filter_map(|p| {
            table
                .by_dir
                .get(p)
                .copied()
                .or_else(|| table.owner(p).map(|(h, _)| h))
        })
        .collect();
    handles.sort();
    handles.dedup();

    if handles.is_empty() {
        return vec![RawBatch::global_overflow()];
    }
    handles
        .into_iter()
        .map(|h| RawBatch::new(h, vec![RawEvent::overflow()]))
        .collect()
}
