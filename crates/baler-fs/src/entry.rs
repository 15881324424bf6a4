use serde::{Deserialize, Serialize};

/// Per-path timestamp fact.
///
/// `safe_time` is the earliest instant at which the path's mtime can be
/// trusted to reflect past writes: `mtime + accuracy` at read time, or
/// `i64::MAX` when the mtime is zero/unknown. `timestamp` carries the raw
/// mtime for files and is absent for directories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampEntry {
    pub safe_time: i64,
    pub timestamp: Option<i64>,
}

/// A single fact captured in a snapshot.
///
/// `Missing` is a positive "did not exist at read time" fact. `Error` marks a
/// read that failed (anything but `NotFound`) and makes the snapshot
/// permanently invalid when checked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotEntry<T> {
    Present(T),
    Missing,
    Error,
}

impl<T> SnapshotEntry<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, SnapshotEntry::Error)
    }
}
