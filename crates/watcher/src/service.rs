//! Watch service: registration API and lifecycle

use crate::backend::{Backend, NotifyBackend};
use crate::dispatch::{self, Counters, LoopState, StateCell, WatchStats};
use crate::ignore::IgnoreRules;
use crate::listener::{Listener, ListenerId, ListenerSet};
use crate::registry::{Interest, Registry};
use crate::walker::{check_directory, TreeWalker};
use crate::{EventKinds, Result, WatchConfig, WatchError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// State shared between the service handle and the dispatch thread.
pub(crate) struct Shared {
    pub(crate) config: WatchConfig,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) registry: Registry,
    pub(crate) listeners: ListenerSet,
    pub(crate) ignore: IgnoreRules,
    /// Roots registered through the public API
    pub(crate) roots: RwLock<HashMap<PathBuf, Interest>>,
    pub(crate) state: StateCell,
    pub(crate) stats: Counters,
    closed: AtomicBool,
}

/// Outcome of a successful [`WatchService::register_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    /// Canonical form of the registered root
    pub root: PathBuf,
    /// Directories newly watched by this call
    pub directories: usize,
    /// Subdirectories that could not be watched
    pub failed: usize,
}

/// Recursive filesystem watch service.
///
/// Register roots with [`register_path`](Self::register_path), attach
/// listeners, then [`start`](Self::start) the dispatch thread. Listeners run
/// on that thread and must not block for long.
pub struct WatchService {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WatchService {
    /// Create a service over the platform's native notification API.
    pub fn new(config: WatchConfig) -> Result<Self> {
        let backend = NotifyBackend::new()?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Create a service over any backend.
    pub fn with_backend(config: WatchConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let ignore = IgnoreRules::new(&config.ignore)?;
        let registry = Registry::new(Arc::clone(&backend), config.debounce_window());

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backend,
                registry,
                listeners: ListenerSet::new(),
                ignore,
                roots: RwLock::new(HashMap::new()),
                state: StateCell::new(),
                stats: Counters::default(),
                closed: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Start the dispatch thread.
    pub fn start(&self) -> Result<()> {
        self.ensure_open()?;
        if !self.shared.state.transition(LoopState::Stopped, LoopState::Running) {
            return Err(WatchError::AlreadyRunning);
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("watch-dispatch".into())
            .spawn(move || dispatch::run(shared));

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                info!("watch service started");
                Ok(())
            }
            Err(e) => {
                self.shared.state.set(LoopState::Stopped);
                Err(WatchError::io("watch-dispatch", e))
            }
        }
    }

    /// Watch `path`, and with `recursive` every directory below it, for the
    /// given kinds. Registering an already watched root replaces its kinds.
    pub fn register_path(
        &self,
        path: impl AsRef<Path>,
        recursive: bool,
        kinds: EventKinds,
    ) -> Result<Registered> {
        self.ensure_open()?;
        let path = path.as_ref();
        check_directory(path)?;

        let root = path.canonicalize().map_err(|e| WatchError::io(path, e))?;
        if root.parent().is_none() {
            return Err(WatchError::NoParent(root));
        }

        let interest = Interest::new(kinds, recursive);
        let summary = TreeWalker::new(&self.shared.registry, &self.shared.ignore)
            .follow_links(self.shared.config.follow_links)
            .update_existing(true)
            .walk(&root, interest)?;

        if !self.shared.registry.contains(&root) {
            self.ensure_open()?;
            return Err(WatchError::RegistrationFailed(root));
        }
        self.shared.roots.write().insert(root.clone(), interest);

        info!(
            "watching {} ({} directories, recursive: {})",
            root.display(),
            summary.registered.len(),
            recursive
        );
        Ok(Registered {
            root,
            directories: summary.registered.len(),
            failed: summary.failed,
        })
    }

    /// Stop watching `path` and everything registered beneath it.
    ///
    /// Returns the number of watched paths dropped.
    pub fn unregister_path(&self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        let root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.shared.roots.write().retain(|r, _| !r.starts_with(&root));
        let removed = self.shared.registry.remove_tree(&root);
        debug!("unregistered {} ({} paths)", root.display(), removed.len());
        removed.len()
    }

    /// Subscribe a listener. Listeners are called in the order they were added.
    pub fn add_listener<L: Listener + 'static>(&self, listener: L) -> ListenerId {
        self.shared.listeners.add(Arc::new(listener))
    }

    /// Unsubscribe a listener. Returns false if it was not subscribed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.get() == LoopState::Running
    }

    pub fn state(&self) -> LoopState {
        self.shared.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_watched(&self, path: impl AsRef<Path>) -> bool {
        self.shared.registry.contains(path.as_ref())
    }

    /// Every path currently under observation, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.shared.registry.paths()
    }

    /// Roots registered through [`register_path`](Self::register_path), sorted.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<_> = self.shared.roots.read().keys().cloned().collect();
        roots.sort();
        roots
    }

    pub fn stats(&self) -> WatchStats {
        self.shared.stats.snapshot()
    }

    /// Stop the dispatch thread and release every backend watch.
    ///
    /// Idempotent. Safe to call from a listener, in which case the loop
    /// exits once that listener returns.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing watch service");

        self.shared
            .state
            .transition(LoopState::Running, LoopState::Closing);
        self.shared.registry.close();
        self.shared.backend.close();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == thread::current().id() {
                debug!("close called from the dispatch thread");
                return;
            }
            if handle.join().is_err() {
                error!("dispatch thread panicked");
            }
        }
        self.shared.state.set(LoopState::Stopped);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(WatchError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ManualBackend, RawBatch, RawEvent, RawKind};
    use crate::EventKind;
    use crossbeam_channel::{unbounded, Receiver};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(200);

    struct Fixture {
        temp_dir: TempDir,
        root: PathBuf,
        backend: Arc<ManualBackend>,
        service: WatchService,
        events: Receiver<(PathBuf, EventKind)>,
    }

    fn fixture(config: WatchConfig) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();
        let root = root.canonicalize().unwrap();

        let backend = Arc::new(ManualBackend::new());
        let service = WatchService::with_backend(config, backend.clone()).unwrap();
        let (tx, events) = unbounded();
        service.add_listener(move |path: &Path, kind: EventKind| {
            let _ = tx.send((path.to_path_buf(), kind));
        });

        Fixture {
            temp_dir,
            root,
            backend,
            service,
            events,
        }
    }

    fn started(config: WatchConfig) -> Fixture {
        let fx = fixture(config);
        fx.service
            .register_path(&fx.root, true, EventKinds::all())
            .unwrap();
        fx.service.start().unwrap();
        fx
    }

    fn drain(events: &Receiver<(PathBuf, EventKind)>) -> Vec<(PathBuf, EventKind)> {
        let mut seen = Vec::new();
        while let Ok(event) = events.recv_timeout(QUIET) {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_register_missing_or_file_fails() {
        let fx = fixture(WatchConfig::default());
        let missing = fx.temp_dir.path().join("missing");
        let file = fx.temp_dir.path().join("file.txt");
        fs::write(&file, b"x").unwrap();

        let err = fx.service.register_path(&missing, true, EventKinds::all()).unwrap_err();
        assert!(matches!(err, WatchError::NotFound(_)));
        assert!(err.is_configuration());

        let err = fx.service.register_path(&file, true, EventKinds::all()).unwrap_err();
        assert!(matches!(err, WatchError::NotADirectory(_)));
    }

    #[test]
    fn test_register_backend_refusal() {
        let fx = fixture(WatchConfig::default());
        fx.backend.refuse(&fx.root);

        let err = fx.service.register_path(&fx.root, false, EventKinds::all()).unwrap_err();
        assert!(matches!(err, WatchError::RegistrationFailed(_)));
        assert!(fx.service.roots().is_empty());
    }

    #[test]
    fn test_register_recursive_counts_directories() {
        let fx = fixture(WatchConfig::default());
        fs::create_dir_all(fx.root.join("a/b")).unwrap();

        let registered = fx.service.register_path(&fx.root, true, EventKinds::all()).unwrap();
        assert_eq!(registered.root, fx.root);
        assert_eq!(registered.directories, 3);
        assert_eq!(fx.service.roots(), vec![fx.root.clone()]);
        assert!(fx.service.is_watched(fx.root.join("a/b")));
    }

    #[test]
    fn test_file_created_delivered_once() {
        let fx = started(WatchConfig::default());
        fs::write(fx.root.join("b.txt"), b"x").unwrap();

        fx.backend.emit(
            &fx.root,
            [(RawKind::Created, "b.txt"), (RawKind::Created, "b.txt")],
        );

        let events = drain(&fx.events);
        assert_eq!(events, vec![(fx.root.join("b.txt"), EventKind::Created)]);
        assert_eq!(fx.service.stats().suppressed, 1);
    }

    #[test]
    fn test_modified_twice_within_window() {
        let fx = started(WatchConfig::default());
        let file = fx.root.join("f.txt");
        fs::write(&file, b"x").unwrap();

        fx.backend.emit(&fx.root, [(RawKind::Modified, "f.txt")]);
        fx.backend.emit(&fx.root, [(RawKind::Modified, "f.txt")]);
        assert_eq!(drain(&fx.events).len(), 1);

        // The window has long passed after the quiet period.
        fx.backend.emit(&fx.root, [(RawKind::Modified, "f.txt")]);
        assert_eq!(drain(&fx.events), vec![(file, EventKind::Modified)]);
    }

    #[test]
    fn test_new_directory_is_expanded() {
        // Wide window so the late duplicate below still falls inside it.
        let config = WatchConfig {
            debounce_ms: 10_000,
            ..WatchConfig::default()
        };
        let fx = started(config);
        let a = fx.root.join("a");
        fs::create_dir(&a).unwrap();
        fs::write(a.join("b.txt"), b"x").unwrap();

        fx.backend.emit(&fx.root, [(RawKind::Created, "a")]);
        let events = drain(&fx.events);
        assert_eq!(
            events,
            vec![
                (a.clone(), EventKind::Created),
                (a.join("b.txt"), EventKind::Created),
            ]
        );
        assert!(fx.service.is_watched(&a));

        // The real backend event for b.txt arriving late is a duplicate.
        fx.backend.emit(&a, [(RawKind::Created, "b.txt")]);
        fx.backend.emit(&a, [(RawKind::Created, "c.txt")]);
        let later = drain(&fx.events);
        assert_eq!(later, vec![(a.join("c.txt"), EventKind::Created)]);
    }

    #[test]
    fn test_deleted_directory_removed_without_cross_talk() {
        let fx = fixture(WatchConfig::default());
        fs::create_dir(fx.root.join("gone")).unwrap();
        fs::create_dir(fx.root.join("kept")).unwrap();
        fx.service.register_path(&fx.root, true, EventKinds::all()).unwrap();
        fx.service.start().unwrap();

        let gone = fx.root.join("gone");
        let kept = fx.root.join("kept");
        fs::remove_dir(&gone).unwrap();
        fx.backend.emit(&fx.root, [(RawKind::Deleted, "gone")]);
        // Same deletion seen twice, as inotify does for a watched directory.
        fx.backend.emit(&fx.root, [(RawKind::Deleted, "gone")]);
        assert_eq!(drain(&fx.events), vec![(gone.clone(), EventKind::Deleted)]);
        assert!(!fx.service.is_watched(&gone));
        assert!(fx.backend.handle_for(&gone).is_none());

        fx.backend.emit(&kept, [(RawKind::Created, "x")]);
        assert_eq!(drain(&fx.events), vec![(kept.join("x"), EventKind::Created)]);
    }

    #[test]
    fn test_stale_handle_is_discarded() {
        let fx = started(WatchConfig::default());
        let handle = fx.backend.handle_for(&fx.root).unwrap();
        fx.service.unregister_path(&fx.root);

        fx.backend.emit_raw(RawBatch::new(
            handle,
            vec![RawEvent::new(RawKind::Created, "late.txt")],
        ));
        assert!(drain(&fx.events).is_empty());
        assert!(fx.service.is_running());
    }

    #[test]
    fn test_interest_filters_kinds() {
        let fx = fixture(WatchConfig::default());
        fx.service
            .register_path(&fx.root, true, EventKind::Deleted.into())
            .unwrap();
        fx.service.start().unwrap();

        fx.backend.emit(
            &fx.root,
            [(RawKind::Created, "a.txt"), (RawKind::Deleted, "b.txt")],
        );
        assert_eq!(drain(&fx.events), vec![(fx.root.join("b.txt"), EventKind::Deleted)]);
    }

    #[test]
    fn test_ignored_paths_not_reported() {
        let config = WatchConfig {
            ignore: vec!["*.swp".into()],
            ..WatchConfig::default()
        };
        let fx = started(config);

        fx.backend.emit(
            &fx.root,
            [(RawKind::Modified, ".x.swp"), (RawKind::Modified, "x")],
        );
        assert_eq!(drain(&fx.events), vec![(fx.root.join("x"), EventKind::Modified)]);
    }

    #[test]
    fn test_rearm_failure_drops_only_that_watch() {
        let fx = fixture(WatchConfig::default());
        fs::create_dir(fx.root.join("sub")).unwrap();
        fx.service.register_path(&fx.root, true, EventKinds::all()).unwrap();
        fx.service.start().unwrap();

        let sub = fx.root.join("sub");
        fx.backend.invalidate(&sub);
        fx.backend.emit(&sub, [(RawKind::Created, "one")]);
        assert_eq!(drain(&fx.events).len(), 1);
        assert!(!fx.service.is_watched(&sub));
        assert_eq!(fx.service.stats().rearm_failures, 1);

        fx.backend.emit(&fx.root, [(RawKind::Created, "two")]);
        assert_eq!(drain(&fx.events), vec![(fx.root.join("two"), EventKind::Created)]);
        assert!(fx.backend.rearm_count() >= 1);
    }

    #[test]
    fn test_deleted_subtree_is_not_a_rearm_failure() {
        let fx = fixture(WatchConfig::default());
        let gone = fx.root.join("gone");
        let inner = gone.join("inner");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join("f.txt"), b"x").unwrap();
        fx.service.register_path(&fx.root, true, EventKinds::all()).unwrap();
        fx.service.start().unwrap();

        // Batches for a recursive delete arrive deepest first, after the
        // directories have already left the disk.
        fs::remove_dir_all(&gone).unwrap();
        fx.backend.invalidate(&inner);
        fx.backend.emit(&inner, [(RawKind::Deleted, "f.txt")]);
        fx.backend.emit(&gone, [(RawKind::Deleted, "inner")]);
        fx.backend.emit(&fx.root, [(RawKind::Deleted, "gone")]);

        assert_eq!(
            drain(&fx.events),
            vec![
                (inner.join("f.txt"), EventKind::Deleted),
                (inner.clone(), EventKind::Deleted),
                (gone.clone(), EventKind::Deleted),
            ]
        );
        assert_eq!(fx.service.stats().rearm_failures, 0);
        assert!(!fx.service.is_watched(&inner));
        assert!(!fx.service.is_watched(&gone));
        assert_eq!(fx.service.watched_paths(), vec![fx.root.clone()]);
    }

    #[test]
    fn test_dead_parent_watch_keeps_root() {
        let fx = started(WatchConfig::default());
        let parent = fx.root.parent().unwrap().to_path_buf();

        fx.backend.invalidate(&parent);
        fx.backend.emit(&parent, [(RawKind::Modified, "root")]);
        assert_eq!(drain(&fx.events), vec![(fx.root.clone(), EventKind::Modified)]);
        assert_eq!(fx.service.stats().rearm_failures, 1);

        assert_eq!(fx.service.roots(), vec![fx.root.clone()]);
        assert!(fx.service.is_watched(&fx.root));

        fx.backend.emit(&fx.root, [(RawKind::Created, "x")]);
        assert_eq!(drain(&fx.events), vec![(fx.root.join("x"), EventKind::Created)]);
    }

    #[test]
    fn test_register_while_loop_expands() {
        let fx = started(WatchConfig::default());
        let outside = fx.root.parent().unwrap().to_path_buf();
        let others: Vec<PathBuf> = (0..50)
            .map(|i| {
                let dir = outside.join(format!("other-{}", i));
                fs::create_dir(&dir).unwrap();
                dir
            })
            .collect();

        let service = Arc::new(fx.service);
        let registrar = {
            let service = Arc::clone(&service);
            let others = others.clone();
            thread::spawn(move || {
                for dir in &others {
                    service.register_path(dir, true, EventKinds::all()).unwrap();
                }
            })
        };

        let names: Vec<String> = (0..50).map(|i| format!("new-{}", i)).collect();
        for name in &names {
            fs::create_dir_all(fx.root.join(name).join("deep")).unwrap();
            fx.backend.emit(&fx.root, [(RawKind::Created, name.as_str())]);
        }

        registrar.join().unwrap();
        drain(&fx.events);

        for name in &names {
            assert!(service.is_watched(fx.root.join(name).join("deep")), "missing {}", name);
        }
        for dir in &others {
            assert!(service.is_watched(dir), "missing {}", dir.display());
        }
        assert_eq!(service.roots().len(), 51);
        assert!(service.is_running());
        assert_eq!(service.stats().rearm_failures, 0);
    }

    #[test]
    fn test_overflow_rewalks_subtree() {
        let fx = started(WatchConfig::default());
        let missed = fx.root.join("missed");
        fs::create_dir(&missed).unwrap();

        fx.backend.emit_overflow(Some(&fx.root));
        drain(&fx.events);

        assert_eq!(fx.service.stats().overflows, 1);
        assert!(fx.service.is_watched(&missed));
        assert!(fx.service.is_running());
    }

    #[test]
    fn test_global_overflow_rewalks_roots() {
        let fx = started(WatchConfig::default());
        let missed = fx.root.join("deep/missed");
        fs::create_dir_all(&missed).unwrap();

        fx.backend.emit_overflow(None);
        drain(&fx.events);
        assert!(fx.service.is_watched(&missed));
    }

    #[test]
    fn test_overflow_without_rewalk_only_reports() {
        let config = WatchConfig {
            rewalk_on_overflow: false,
            ..WatchConfig::default()
        };
        let fx = started(config);
        fs::create_dir(fx.root.join("missed")).unwrap();

        fx.backend.emit_overflow(Some(&fx.root));
        drain(&fx.events);
        assert_eq!(fx.service.stats().overflows, 1);
        assert!(!fx.service.is_watched(fx.root.join("missed")));
    }

    #[test]
    fn test_listener_can_register_from_callback() {
        let fx = fixture(WatchConfig::default());
        let service = Arc::new(fx.service);
        fx_register_on_event(&service, &fx.temp_dir);
        service.register_path(&fx.root, true, EventKinds::all()).unwrap();
        service.start().unwrap();

        fx.backend.emit(&fx.root, [(RawKind::Created, "trigger")]);
        drain(&fx.events);

        let other = fx.temp_dir.path().join("other").canonicalize().unwrap();
        assert!(service.is_watched(&other));
        service.close();
    }

    fn fx_register_on_event(service: &Arc<WatchService>, temp_dir: &TempDir) {
        let other = temp_dir.path().join("other");
        fs::create_dir(&other).unwrap();
        let weak = Arc::downgrade(service);
        service.add_listener(move |_: &Path, _: EventKind| {
            if let Some(service) = weak.upgrade() {
                let _ = service.register_path(&other, false, EventKinds::all());
            }
        });
    }

    #[test]
    fn test_start_twice_and_after_close() {
        let fx = fixture(WatchConfig::default());
        fx.service.start().unwrap();
        assert!(matches!(fx.service.start(), Err(WatchError::AlreadyRunning)));

        fx.service.close();
        assert!(matches!(fx.service.start(), Err(WatchError::Closed)));
    }

    #[test]
    fn test_close_is_prompt_and_idempotent() {
        let fx = started(WatchConfig::default());
        assert!(fx.service.is_running());

        let begun = std::time::Instant::now();
        fx.service.close();
        assert!(begun.elapsed() < WAIT);
        assert_eq!(fx.service.state(), LoopState::Stopped);
        assert!(fx.backend.watched_dirs().is_empty());

        fx.service.close();
        assert!(fx.service.is_closed());
        assert!(matches!(
            fx.service.register_path(&fx.root, true, EventKinds::all()),
            Err(WatchError::Closed)
        ));
    }
}
