use crate::accuracy::AccuracyEstimator;
use crate::entry::{SnapshotEntry, TimestampEntry};
use crate::error::{FsInfoError, Result};
use crate::fs::InputFileSystem;
use crate::hash::ContentHash;
use crate::managed;
use crate::queue::JobQueue;
use crate::resolve::{self, ModuleGraph, ResolvedBuildDependencies, Resolver};
use crate::snapshot::Snapshot;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use unicode_normalization::UnicodeNormalization;

const FILE_TIMESTAMP_PARALLELISM: usize = 30;
const FILE_HASH_PARALLELISM: usize = 10;
const CONTEXT_HASH_PARALLELISM: usize = 2;
const MANAGED_ITEM_PARALLELISM: usize = 10;

type TimestampResult = Result<Option<TimestampEntry>>;
type HashResult = Result<Option<ContentHash>>;
type ManagedResult = Result<String>;

/// Options for [`FileSystemInfo`].
#[derive(Debug, Clone, Default)]
pub struct FileSystemInfoOptions {
    /// Directory prefixes whose contents are controlled by a package manager.
    /// Paths beneath one are summarized as a single `name@version` fact
    /// instead of being tracked per-file.
    pub managed_paths: Vec<PathBuf>,
}

/// Snapshot mode selector: hash mode captures content/context hashes,
/// timestamp mode (the default) captures timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    pub hash: bool,
}

/// Concurrent, coalescing reader over an [`InputFileSystem`].
///
/// Computes and caches per-path timestamp and content-hash facts, takes
/// snapshots of such facts tied to a start time, and revalidates snapshots
/// against the current filesystem. Reads are serialized through per-kind
/// job queues so concurrent requests for one path share a single read.
pub struct FileSystemInfo {
    inner: Arc<FsInfoInner>,
}

struct FsInfoInner {
    fs: Arc<dyn InputFileSystem>,
    managed_paths: Vec<PathBuf>,
    accuracy: AccuracyEstimator,

    // A cached `None` is a positive "does not exist" fact, not a miss.
    file_timestamps: Mutex<HashMap<PathBuf, Option<TimestampEntry>>>,
    file_hashes: Mutex<HashMap<PathBuf, Option<ContentHash>>>,
    context_timestamps: Mutex<HashMap<PathBuf, Option<TimestampEntry>>>,
    context_hashes: Mutex<HashMap<PathBuf, Option<ContentHash>>>,
    managed_items: Mutex<HashMap<PathBuf, String>>,

    file_timestamp_queue: JobQueue<PathBuf, TimestampResult>,
    file_hash_queue: JobQueue<PathBuf, HashResult>,
    context_hash_queue: JobQueue<PathBuf, HashResult>,
    managed_item_queue: JobQueue<PathBuf, ManagedResult>,
}

impl FileSystemInfo {
    pub fn new(fs: Arc<dyn InputFileSystem>, options: FileSystemInfoOptions) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<FsInfoInner>| {
            let w = weak.clone();
            let file_timestamp_queue = JobQueue::new(
                "file-timestamp",
                FILE_TIMESTAMP_PARALLELISM,
                move |path: &PathBuf| match w.upgrade() {
                    Some(inner) => read_file_timestamp(&inner, path),
                    None => Err(FsInfoError::ShutDown),
                },
            );
            let w = weak.clone();
            let file_hash_queue = JobQueue::new(
                "file-hash",
                FILE_HASH_PARALLELISM,
                move |path: &PathBuf| match w.upgrade() {
                    Some(inner) => read_file_hash(&inner, path),
                    None => Err(FsInfoError::ShutDown),
                },
            );
            let w = weak.clone();
            let context_hash_queue = JobQueue::new(
                "context-hash",
                CONTEXT_HASH_PARALLELISM,
                move |path: &PathBuf| match w.upgrade() {
                    Some(inner) => read_context_hash(&inner, path),
                    None => Err(FsInfoError::ShutDown),
                },
            );
            let w = weak.clone();
            let managed_item_queue = JobQueue::new(
                "managed-item",
                MANAGED_ITEM_PARALLELISM,
                move |path: &PathBuf| match w.upgrade() {
                    Some(inner) => read_managed_item(&inner, path),
                    None => Err(FsInfoError::ShutDown),
                },
            );

            FsInfoInner {
                fs,
                managed_paths: options.managed_paths,
                accuracy: AccuracyEstimator::new(),
                file_timestamps: Mutex::new(HashMap::new()),
                file_hashes: Mutex::new(HashMap::new()),
                context_timestamps: Mutex::new(HashMap::new()),
                context_hashes: Mutex::new(HashMap::new()),
                managed_items: Mutex::new(HashMap::new()),
                file_timestamp_queue,
                file_hash_queue,
                context_hash_queue,
                managed_item_queue,
            }
        });
        Self { inner }
    }

    /// Current mtime-granularity estimate in milliseconds.
    pub fn accuracy_millis(&self) -> i64 {
        self.inner.accuracy.millis()
    }

    pub fn file_timestamp(&self, path: &Path) -> TimestampResult {
        file_timestamp_of(&self.inner, path)
    }

    pub fn file_hash(&self, path: &Path) -> HashResult {
        file_hash_of(&self.inner, path)
    }

    pub fn context_hash(&self, path: &Path) -> HashResult {
        context_hash_of(&self.inner, path)
    }

    /// Reserved. Records a `None` fact for the path; snapshots that request
    /// context timestamps carry `Error` entries and never validate.
    pub fn context_timestamp(&self, path: &Path) -> TimestampResult {
        let mut cache = self.inner.context_timestamps.lock();
        if let Some(hit) = cache.get(path) {
            return Ok(*hit);
        }
        cache.insert(path.to_path_buf(), None);
        Ok(None)
    }

    /// Pre-seed the file-timestamp cache, e.g. from a watcher.
    pub fn add_file_timestamps(
        &self,
        entries: impl IntoIterator<Item = (PathBuf, Option<TimestampEntry>)>,
    ) {
        self.inner.file_timestamps.lock().extend(entries);
    }

    /// Pre-seed the context-timestamp cache.
    pub fn add_context_timestamps(
        &self,
        entries: impl IntoIterator<Item = (PathBuf, Option<TimestampEntry>)>,
    ) {
        self.inner.context_timestamps.lock().extend(entries);
    }

    /// Traverse `deps` from `context` into the sets of files, directories,
    /// and missing paths a build depends on.
    pub fn resolve_build_dependencies(
        &self,
        resolver: &dyn Resolver,
        module_graph: &dyn ModuleGraph,
        context: &Path,
        deps: impl IntoIterator<Item = String>,
    ) -> Result<ResolvedBuildDependencies> {
        resolve::resolve_build_dependencies(
            self.inner.fs.as_ref(),
            resolver,
            module_graph,
            context,
            deps,
        )
    }

    /// Capture a snapshot of the given paths.
    ///
    /// Paths beneath a managed root are folded into managed items. Missing
    /// paths always go through timestamp reads. Read failures other than
    /// `NotFound` record `Error` for the path; the snapshot still completes.
    pub fn create_snapshot(
        &self,
        start_time: Option<i64>,
        files: &[PathBuf],
        directories: &[PathBuf],
        missing: &[PathBuf],
        options: SnapshotOptions,
    ) -> Snapshot {
        let inner = &self.inner;
        let jobs = Arc::new(SnapshotJobs::new(start_time));
        let mut managed_set: BTreeSet<PathBuf> = BTreeSet::new();

        for path in files {
            if let Some(item) = self.managed_item_for(path) {
                managed_set.insert(item);
                continue;
            }
            if options.hash {
                if let Some(hit) = inner.file_hashes.lock().get(path).cloned() {
                    let path = path.clone();
                    jobs.record(move |snapshot| {
                        snapshot.file_hashes.insert(path, present_or_missing(hit));
                    });
                } else {
                    jobs.begin();
                    let jobs = Arc::clone(&jobs);
                    let path2 = path.clone();
                    inner.file_hash_queue.add(path.clone(), move |result| {
                        let entry = hash_snapshot_entry(&path2, result);
                        jobs.complete(move |snapshot| {
                            snapshot.file_hashes.insert(path2, entry);
                        });
                    });
                }
            } else if let Some(hit) = inner.file_timestamps.lock().get(path).copied() {
                let path = path.clone();
                jobs.record(move |snapshot| {
                    snapshot.file_timestamps.insert(path, present_or_missing(hit));
                });
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let path2 = path.clone();
                inner.file_timestamp_queue.add(path.clone(), move |result| {
                    let entry = timestamp_snapshot_entry(&path2, result);
                    jobs.complete(move |snapshot| {
                        snapshot.file_timestamps.insert(path2, entry);
                    });
                });
            }
        }

        for path in directories {
            if let Some(item) = self.managed_item_for(path) {
                managed_set.insert(item);
                continue;
            }
            if options.hash {
                if let Some(hit) = inner.context_hashes.lock().get(path).cloned() {
                    let path = path.clone();
                    jobs.record(move |snapshot| {
                        snapshot.context_hashes.insert(path, present_or_missing(hit));
                    });
                } else {
                    jobs.begin();
                    let jobs = Arc::clone(&jobs);
                    let path2 = path.clone();
                    inner.context_hash_queue.add(path.clone(), move |result| {
                        let entry = hash_snapshot_entry(&path2, result);
                        jobs.complete(move |snapshot| {
                            snapshot.context_hashes.insert(path2, entry);
                        });
                    });
                }
            } else if let Some(hit) = inner.context_timestamps.lock().get(path).copied() {
                let path = path.clone();
                jobs.record(move |snapshot| {
                    snapshot
                        .context_timestamps
                        .insert(path, present_or_missing(hit));
                });
            } else {
                // Context timestamps are a reserved read; capture them as
                // permanently-invalid facts rather than guessing.
                let path = path.clone();
                jobs.record(move |snapshot| {
                    snapshot.context_timestamps.insert(path, SnapshotEntry::Error);
                });
            }
        }

        for path in missing {
            if let Some(item) = self.managed_item_for(path) {
                managed_set.insert(item);
                continue;
            }
            if let Some(hit) = inner.file_timestamps.lock().get(path).copied() {
                let path = path.clone();
                jobs.record(move |snapshot| {
                    snapshot.missing_timestamps.insert(path, present_or_missing(hit));
                });
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let path2 = path.clone();
                inner.file_timestamp_queue.add(path.clone(), move |result| {
                    let entry = timestamp_snapshot_entry(&path2, result);
                    jobs.complete(move |snapshot| {
                        snapshot.missing_timestamps.insert(path2, entry);
                    });
                });
            }
        }

        for item in managed_set {
            if let Some(info) = inner.managed_items.lock().get(&item).cloned() {
                jobs.record(move |snapshot| {
                    snapshot
                        .managed_items
                        .insert(item, SnapshotEntry::Present(info));
                });
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let item2 = item.clone();
                inner.managed_item_queue.add(item, move |result| {
                    let entry = match result {
                        Ok(info) => SnapshotEntry::Present(info.clone()),
                        Err(err) => {
                            tracing::debug!(
                                target = "baler.fs",
                                path = %item2.display(),
                                error = %err,
                                "failed to read managed item for snapshot"
                            );
                            SnapshotEntry::Error
                        }
                    };
                    jobs.complete(move |snapshot| {
                        snapshot.managed_items.insert(item2, entry);
                    });
                });
            }
        }

        jobs.wait()
    }

    /// Check whether every fact in `snapshot` still holds.
    ///
    /// Never errors: any read failure, any `Error` fact, and any
    /// context-timestamp entry make the snapshot invalid. The first failing
    /// predicate wins; completions arriving afterwards are ignored.
    pub fn check_snapshot_valid(&self, snapshot: &Snapshot) -> bool {
        if !snapshot.context_timestamps.is_empty() {
            return false;
        }

        let inner = &self.inner;
        let jobs = Arc::new(ValidationJobs::new());
        let start_time = snapshot.start_time;

        for (path, snap) in &snapshot.file_timestamps {
            if !jobs.still_valid() {
                break;
            }
            if snap.is_error() {
                jobs.fail();
                break;
            }
            if let Some(current) = inner.file_timestamps.lock().get(path).copied() {
                if !check_file(&current, snap, start_time) {
                    jobs.fail();
                    break;
                }
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let snap = snap.clone();
                inner.file_timestamp_queue.add(path.clone(), move |result| {
                    let ok = match result {
                        Ok(current) => check_file(current, &snap, start_time),
                        Err(_) => false,
                    };
                    jobs.complete(ok);
                });
            }
        }

        for (path, snap) in &snapshot.file_hashes {
            if !jobs.still_valid() {
                break;
            }
            if snap.is_error() {
                jobs.fail();
                break;
            }
            if let Some(current) = inner.file_hashes.lock().get(path).cloned() {
                if !check_hash(&current, snap) {
                    jobs.fail();
                    break;
                }
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let snap = snap.clone();
                inner.file_hash_queue.add(path.clone(), move |result| {
                    let ok = match result {
                        Ok(current) => check_hash(current, &snap),
                        Err(_) => false,
                    };
                    jobs.complete(ok);
                });
            }
        }

        for (path, snap) in &snapshot.context_hashes {
            if !jobs.still_valid() {
                break;
            }
            if snap.is_error() {
                jobs.fail();
                break;
            }
            if let Some(current) = inner.context_hashes.lock().get(path).cloned() {
                if !check_hash(&current, snap) {
                    jobs.fail();
                    break;
                }
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let snap = snap.clone();
                inner.context_hash_queue.add(path.clone(), move |result| {
                    let ok = match result {
                        Ok(current) => check_hash(current, &snap),
                        Err(_) => false,
                    };
                    jobs.complete(ok);
                });
            }
        }

        for (path, snap) in &snapshot.missing_timestamps {
            if !jobs.still_valid() {
                break;
            }
            if snap.is_error() {
                jobs.fail();
                break;
            }
            if let Some(current) = inner.file_timestamps.lock().get(path).copied() {
                if !check_existence(&current, snap) {
                    jobs.fail();
                    break;
                }
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let snap = snap.clone();
                inner.file_timestamp_queue.add(path.clone(), move |result| {
                    let ok = match result {
                        Ok(current) => check_existence(current, &snap),
                        Err(_) => false,
                    };
                    jobs.complete(ok);
                });
            }
        }

        for (item, snap) in &snapshot.managed_items {
            if !jobs.still_valid() {
                break;
            }
            if snap.is_error() {
                jobs.fail();
                break;
            }
            if let Some(current) = inner.managed_items.lock().get(item).cloned() {
                if !check_managed(&current, snap) {
                    jobs.fail();
                    break;
                }
            } else {
                jobs.begin();
                let jobs = Arc::clone(&jobs);
                let snap = snap.clone();
                inner.managed_item_queue.add(item.clone(), move |result| {
                    let ok = match result {
                        Ok(current) => check_managed(current, &snap),
                        Err(_) => false,
                    };
                    jobs.complete(ok);
                });
            }
        }

        jobs.wait()
    }

    fn managed_item_for(&self, path: &Path) -> Option<PathBuf> {
        self.inner
            .managed_paths
            .iter()
            .find_map(|root| managed::managed_item(root, path))
    }
}

fn file_timestamp_of(inner: &Arc<FsInfoInner>, path: &Path) -> TimestampResult {
    if let Some(hit) = inner.file_timestamps.lock().get(path) {
        return Ok(*hit);
    }
    inner.file_timestamp_queue.compute(path.to_path_buf())
}

fn file_hash_of(inner: &Arc<FsInfoInner>, path: &Path) -> HashResult {
    if let Some(hit) = inner.file_hashes.lock().get(path) {
        return Ok(hit.clone());
    }
    inner.file_hash_queue.compute(path.to_path_buf())
}

fn context_hash_of(inner: &Arc<FsInfoInner>, path: &Path) -> HashResult {
    if let Some(hit) = inner.context_hashes.lock().get(path) {
        return Ok(hit.clone());
    }
    inner.context_hash_queue.compute(path.to_path_buf())
}

fn read_file_timestamp(inner: &Arc<FsInfoInner>, path: &Path) -> TimestampResult {
    let entry = match inner.fs.stat(path) {
        Ok(stat) => {
            let mtime = stat.mtime_ms;
            let safe_time = if mtime == 0 {
                i64::MAX
            } else {
                mtime.saturating_add(inner.accuracy.millis())
            };
            inner.accuracy.observe(mtime);
            Some(TimestampEntry {
                safe_time,
                timestamp: if stat.is_dir { None } else { Some(mtime) },
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(FsInfoError::io(path, err)),
    };
    inner.file_timestamps.lock().insert(path.to_path_buf(), entry);
    Ok(entry)
}

fn read_file_hash(inner: &Arc<FsInfoInner>, path: &Path) -> HashResult {
    let value = match inner.fs.read(path) {
        Ok(bytes) => Some(ContentHash::from_bytes(&bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(FsInfoError::io(path, err)),
    };
    inner
        .file_hashes
        .lock()
        .insert(path.to_path_buf(), value.clone());
    Ok(value)
}

fn read_context_hash(inner: &Arc<FsInfoInner>, path: &Path) -> HashResult {
    let names = match inner.fs.read_dir(path) {
        Ok(names) => names,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            inner.context_hashes.lock().insert(path.to_path_buf(), None);
            return Ok(None);
        }
        Err(err) => return Err(FsInfoError::io(path, err)),
    };

    // Digest by NFC-normalized name so the hash is stable across filesystems
    // with different name normalization, but access children by the name the
    // filesystem actually reported.
    let mut names: Vec<(String, String)> = names
        .into_iter()
        .map(|name| (name.nfc().collect::<String>(), name))
        .filter(|(normalized, _)| !normalized.starts_with('.'))
        .collect();
    names.sort_unstable();

    let mut child_hashes = Vec::with_capacity(names.len());
    for (_, original) in &names {
        let child = path.join(original);
        let stat = match inner.fs.stat(&child) {
            Ok(stat) => stat,
            // The entry vanished between readdir and stat; it contributes
            // nothing, like other non-file non-directory entries.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                child_hashes.push(String::new());
                continue;
            }
            Err(err) => return Err(FsInfoError::io(&child, err)),
        };
        if stat.is_file {
            let hash = file_hash_of(inner, &child)?;
            child_hashes.push(hash.map(|h| h.as_str().to_string()).unwrap_or_default());
        } else if stat.is_dir {
            // Recursing through our own queue can saturate its budget while
            // this job waits on the child, so widen it for the duration.
            inner.context_hash_queue.increase_parallelism();
            let result = context_hash_of(inner, &child);
            inner.context_hash_queue.decrease_parallelism();
            let hash = result?;
            child_hashes.push(hash.map(|h| h.as_str().to_string()).unwrap_or_default());
        } else {
            child_hashes.push(String::new());
        }
    }

    let mut hasher = ContentHash::hasher();
    for (normalized, _) in &names {
        sha2::Digest::update(&mut hasher, normalized.as_bytes());
    }
    for hash in &child_hashes {
        sha2::Digest::update(&mut hasher, hash.as_bytes());
    }
    let digest = ContentHash::from_digest(hasher);
    inner
        .context_hashes
        .lock()
        .insert(path.to_path_buf(), Some(digest.clone()));
    Ok(Some(digest))
}

fn read_managed_item(inner: &Arc<FsInfoInner>, item: &Path) -> ManagedResult {
    let info = managed::read_managed_item_info(inner.fs.as_ref(), item)?;
    // Memoized on success only; failures stay out of the cache so a later
    // snapshot can observe a repaired package.
    inner
        .managed_items
        .lock()
        .insert(item.to_path_buf(), info.clone());
    Ok(info)
}

fn present_or_missing<T>(value: Option<T>) -> SnapshotEntry<T> {
    match value {
        Some(value) => SnapshotEntry::Present(value),
        None => SnapshotEntry::Missing,
    }
}

fn timestamp_snapshot_entry(
    path: &Path,
    result: &TimestampResult,
) -> SnapshotEntry<TimestampEntry> {
    match result {
        Ok(value) => present_or_missing(*value),
        Err(err) => {
            tracing::debug!(
                target = "baler.fs",
                path = %path.display(),
                error = %err,
                "failed to read timestamp for snapshot"
            );
            SnapshotEntry::Error
        }
    }
}

fn hash_snapshot_entry(path: &Path, result: &HashResult) -> SnapshotEntry<ContentHash> {
    match result {
        Ok(value) => present_or_missing(value.clone()),
        Err(err) => {
            tracing::debug!(
                target = "baler.fs",
                path = %path.display(),
                error = %err,
                "failed to read hash for snapshot"
            );
            SnapshotEntry::Error
        }
    }
}

fn check_file(
    current: &Option<TimestampEntry>,
    snap: &SnapshotEntry<TimestampEntry>,
    start_time: Option<i64>,
) -> bool {
    match snap {
        SnapshotEntry::Error => false,
        SnapshotEntry::Missing => current.is_none(),
        SnapshotEntry::Present(snap_entry) => match current {
            None => false,
            Some(current_entry) => {
                // The freshness window overlapping the snapshot start means a
                // silent modification is possible.
                if let Some(start) = start_time {
                    if current_entry.safe_time > start {
                        return false;
                    }
                }
                match snap_entry.timestamp {
                    Some(timestamp) => current_entry.timestamp == Some(timestamp),
                    None => true,
                }
            }
        },
    }
}

fn check_hash(current: &Option<ContentHash>, snap: &SnapshotEntry<ContentHash>) -> bool {
    match snap {
        SnapshotEntry::Error => false,
        SnapshotEntry::Missing => current.is_none(),
        SnapshotEntry::Present(hash) => current.as_ref() == Some(hash),
    }
}

fn check_existence(
    current: &Option<TimestampEntry>,
    snap: &SnapshotEntry<TimestampEntry>,
) -> bool {
    match snap {
        SnapshotEntry::Error => false,
        SnapshotEntry::Missing => current.is_none(),
        SnapshotEntry::Present(_) => current.is_some(),
    }
}

fn check_managed(current: &str, snap: &SnapshotEntry<String>) -> bool {
    match snap {
        SnapshotEntry::Error | SnapshotEntry::Missing => false,
        SnapshotEntry::Present(info) => info == current,
    }
}

struct SnapshotJobs {
    state: Mutex<SnapshotJobsState>,
    done: Condvar,
}

struct SnapshotJobsState {
    snapshot: Snapshot,
    outstanding: usize,
}

impl SnapshotJobs {
    fn new(start_time: Option<i64>) -> Self {
        Self {
            state: Mutex::new(SnapshotJobsState {
                snapshot: Snapshot {
                    start_time,
                    ..Default::default()
                },
                outstanding: 0,
            }),
            done: Condvar::new(),
        }
    }

    fn begin(&self) {
        self.state.lock().outstanding += 1;
    }

    fn record(&self, apply: impl FnOnce(&mut Snapshot)) {
        apply(&mut self.state.lock().snapshot);
    }

    fn complete(&self, apply: impl FnOnce(&mut Snapshot)) {
        let mut state = self.state.lock();
        apply(&mut state.snapshot);
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) -> Snapshot {
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            self.done.wait(&mut state);
        }
        std::mem::take(&mut state.snapshot)
    }
}

struct ValidationJobs {
    state: Mutex<ValidationState>,
    done: Condvar,
}

struct ValidationState {
    outstanding: usize,
    valid: bool,
}

impl ValidationJobs {
    fn new() -> Self {
        Self {
            state: Mutex::new(ValidationState {
                outstanding: 0,
                valid: true,
            }),
            done: Condvar::new(),
        }
    }

    fn begin(&self) {
        self.state.lock().outstanding += 1;
    }

    fn fail(&self) {
        self.state.lock().valid = false;
        self.done.notify_all();
    }

    fn complete(&self, ok: bool) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        if !ok {
            state.valid = false;
        }
        if state.outstanding == 0 || !state.valid {
            self.done.notify_all();
        }
    }

    fn still_valid(&self) -> bool {
        self.state.lock().valid
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while state.valid && state.outstanding > 0 {
            self.done.wait(&mut state);
        }
        state.valid
    }
}
