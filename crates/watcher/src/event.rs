//! Event kinds delivered to listeners and the interest sets built from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of structural change delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// File or directory created
    Created,
    /// File or directory modified
    Modified,
    /// File or directory deleted
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Created, EventKind::Modified, EventKind::Deleted];

    fn bit(self) -> u8 {
        match self {
            EventKind::Created => 0b001,
            EventKind::Modified => 0b010,
            EventKind::Deleted => 0b100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Modified => "modified",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of event kinds a watched path is interested in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventKinds(u8);

impl EventKinds {
    pub const fn empty() -> Self {
        EventKinds(0)
    }

    pub const fn all() -> Self {
        EventKinds(0b111)
    }

    pub fn with(mut self, kind: EventKind) -> Self {
        self.0 |= kind.bit();
        self
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<EventKind> for EventKinds {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        iter.into_iter().fold(EventKinds::empty(), EventKinds::with)
    }
}

impl From<EventKind> for EventKinds {
    fn from(kind: EventKind) -> Self {
        EventKinds::empty().with(kind)
    }
}

impl fmt::Debug for EventKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
