use crate::entry::{SnapshotEntry, TimestampEntry};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// An immutable bundle of filesystem facts taken at a given start time.
///
/// A snapshot is either timestamp-mode or hash-mode per `create_snapshot`
/// call, so a path appears in at most one of `file_timestamps` and
/// `file_hashes`. Paths below a managed root are folded into `managed_items`
/// and never tracked per-file. An empty map stands in for an absent mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub start_time: Option<i64>,
    pub file_timestamps: BTreeMap<PathBuf, SnapshotEntry<TimestampEntry>>,
    pub file_hashes: BTreeMap<PathBuf, SnapshotEntry<ContentHash>>,
    pub context_timestamps: BTreeMap<PathBuf, SnapshotEntry<TimestampEntry>>,
    pub context_hashes: BTreeMap<PathBuf, SnapshotEntry<ContentHash>>,
    pub missing_timestamps: BTreeMap<PathBuf, SnapshotEntry<TimestampEntry>>,
    pub managed_items: BTreeMap<PathBuf, SnapshotEntry<String>>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.file_timestamps.is_empty()
            && self.file_hashes.is_empty()
            && self.context_timestamps.is_empty()
            && self.context_hashes.is_empty()
            && self.missing_timestamps.is_empty()
            && self.managed_items.is_empty()
    }

    /// Merge two snapshots, `b` winning on key collisions.
    ///
    /// The merged `start_time` is the minimum when both sides carry one and
    /// the present side otherwise, so the trust window never widens.
    pub fn merge(mut a: Snapshot, b: Snapshot) -> Snapshot {
        a.start_time = match (a.start_time, b.start_time) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (x, y) => x.or(y),
        };
        a.file_timestamps.extend(b.file_timestamps);
        a.file_hashes.extend(b.file_hashes);
        a.context_timestamps.extend(b.context_timestamps);
        a.context_hashes.extend(b.context_hashes);
        a.missing_timestamps.extend(b.missing_timestamps);
        a.managed_items.extend(b.managed_items);
        a
    }
}
