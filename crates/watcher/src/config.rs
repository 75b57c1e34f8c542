//! Watch service configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default coalescing window for repeated events on one path.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Tunables for a [`WatchService`](crate::WatchService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Events of the same kind for the same path within this many
    /// milliseconds of the last delivered one are dropped.
    pub debounce_ms: u64,

    /// Re-walk the affected subtree when the backend reports dropped events.
    pub rewalk_on_overflow: bool,

    /// Follow symbolic links while walking directory trees.
    pub follow_links: bool,

    /// Gitignore-style patterns for paths that are neither watched nor reported.
    pub ignore: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            rewalk_on_overflow: true,
            follow_links: false,
            ignore: Vec::new(),
        }
    }
}

impl WatchConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
