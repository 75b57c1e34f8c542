//! Recursive tree walker
//!
//! Registers every directory of an existing subtree. Used once per root at
//! registration time and again by the dispatch loop whenever a new directory
//! shows up under a recursive watch.

use crate::ignore::IgnoreRules;
use crate::registry::{Interest, Registry};
use crate::{Result, WatchError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Outcome of one walk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalkSummary {
    /// Directories newly registered (or updated) by this walk
    pub registered: Vec<PathBuf>,
    /// Entries found below the root, in walk order. Only filled when the
    /// walker was asked to collect them.
    pub discovered: Vec<PathBuf>,
    /// Directories or entries that could not be registered or read
    pub failed: usize,
}

/// Walks directory trees into a [`Registry`].
pub struct TreeWalker<'a> {
    registry: &'a Registry,
    ignore: &'a IgnoreRules,
    follow_links: bool,
    update_if_existing: bool,
    collect: bool,
}

impl<'a> TreeWalker<'a> {
    pub fn new(registry: &'a Registry, ignore: &'a IgnoreRules) -> Self {
        Self {
            registry,
            ignore,
            follow_links: false,
            update_if_existing: false,
            collect: false,
        }
    }

    pub fn follow_links(mut self, yes: bool) -> Self {
        self.follow_links = yes;
        self
    }

    /// Replace the interest of directories that are already registered.
    pub fn update_existing(mut self, yes: bool) -> Self {
        self.update_if_existing = yes;
        self
    }

    /// Record every entry below the root in [`WalkSummary::discovered`].
    pub fn collect_entries(mut self, yes: bool) -> Self {
        self.collect = yes;
        self
    }

    /// Register `root` and, if `interest.recursive`, every directory under it.
    ///
    /// Fails immediately if `root` does not exist or is not a directory.
    pub fn walk(&self, root: &Path, interest: Interest) -> Result<WalkSummary> {
        check_directory(root)?;

        let mut summary = WalkSummary::default();
        if !interest.recursive {
            self.register(root, interest, &mut summary);
            return Ok(summary);
        }

        let ignore = self.ignore;
        let walker = WalkDir::new(root)
            .follow_links(self.follow_links)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !ignore.should_ignore(e.path(), e.file_type().is_dir()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(WatchError::Walk(e)),
                Err(e) => {
                    // Entries vanishing mid-walk are an expected race.
                    warn!("skipping during walk of {}: {}", root.display(), e);
                    summary.failed += 1;
                    continue;
                }
            };

            if self.collect && entry.depth() > 0 {
                summary.discovered.push(entry.path().to_path_buf());
            }
            if entry.file_type().is_dir() {
                self.register(entry.path(), interest, &mut summary);
            }
        }

        debug!(
            "walked {}: {} registered, {} failed",
            root.display(),
            summary.registered.len(),
            summary.failed
        );
        Ok(summary)
    }

    fn register(&self, dir: &Path, interest: Interest, summary: &mut WalkSummary) {
        if self.registry.register(dir, interest, self.update_if_existing) {
            summary.registered.push(dir.to_path_buf());
        } else if !self.registry.contains(dir) {
            summary.failed += 1;
        }
    }
}

/// Configuration check shared by the walker and the service.
pub(crate) fn check_directory(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(WatchError::NotADirectory(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(WatchError::NotFound(path.to_path_buf())),
        Err(e) => Err(WatchError::io(path, e)),
    }
}
