//! Error types for the watch service.
//!
//! Configuration errors are returned straight to the caller of
//! `register_path`. Backend and race conditions inside the dispatch loop are
//! logged and degrade a single watch instead of surfacing here.

use crate::backend::WatchHandle;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Things that can go wrong while registering or running watches.
#[derive(Error, Debug)]
pub enum WatchError {
    /// Registration target does not exist.
    #[error("folder '{0}' does not exist")]
    NotFound(PathBuf),

    /// Registration target exists but is not a directory.
    #[error("'{0}' is not a directory")]
    NotADirectory(PathBuf),

    /// Filesystem roots cannot be watched: there is no parent to attach to.
    #[error("'{0}' has no parent directory")]
    NoParent(PathBuf),

    /// The native notification backend refused an operation.
    #[error("watch backend failed for '{path}': {source}")]
    Backend {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// The root could not be registered (see the log for the backend cause).
    #[error("could not watch '{0}'")]
    RegistrationFailed(PathBuf),

    /// A handle that the backend no longer recognises.
    #[error("watch handle {0} is no longer valid")]
    HandleInvalid(WatchHandle),

    /// I/O failure while inspecting a path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory traversal failed part-way.
    #[error("walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    /// An ignore pattern could not be compiled.
    #[error("invalid ignore pattern: {0}")]
    Ignore(#[from] ignore::Error),

    /// `start` was called on a service whose loop is already running.
    #[error("dispatch loop is already running")]
    AlreadyRunning,

    /// The service has been closed.
    #[error("watch service is closed")]
    Closed,
}

impl WatchError {
    /// Creates an IO error with the path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a backend failure with the path it concerned.
    pub fn backend(path: impl Into<PathBuf>, source: notify::Error) -> Self {
        Self::Backend {
            path: path.into(),
            source,
        }
    }

    /// True for errors caused by how the caller configured the watch.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::NotADirectory(_) | Self::NoParent(_)
        )
    }
}
