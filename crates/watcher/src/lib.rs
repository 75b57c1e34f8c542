//! Recursive file system watching
//!
//! This crate watches directory trees and reports structural changes:
//! - Per-directory native watches, extended automatically to new subdirectories
//! - Per-path debouncing of duplicate backend events (100ms default)
//! - Overflow reporting with optional subtree re-walk
//! - Ordered, synchronous fan-out to registered listeners
//!
//! ```no_run
//! use watcher::{EventKind, EventKinds, WatchConfig, WatchService};
//! use std::path::Path;
//!
//! let service = WatchService::new(WatchConfig::default()).unwrap();
//! service.register_path("/tmp/root", true, EventKinds::all()).unwrap();
//! service.add_listener(|path: &Path, kind: EventKind| {
//!     println!("{} {}", kind, path.display());
//! });
//! service.start().unwrap();
//! ```

pub mod backend;
pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod ignore;
pub mod listener;
pub mod registry;
pub mod service;
pub mod walker;

pub use backend::{Backend, ManualBackend, NotifyBackend, RawBatch, RawEvent, RawKind, WatchHandle};
pub use config::WatchConfig;
pub use dispatch::{LoopState, WatchStats};
pub use error::{Result, WatchError};
pub use event::{EventKind, EventKinds};
pub use listener::{Listener, ListenerId};
pub use service::{Registered, WatchService};
