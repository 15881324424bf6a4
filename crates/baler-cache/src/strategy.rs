use crate::error::CacheError;
use crate::pack::Pack;
use baler_fs::{FileSystemInfo, ModuleGraph, Resolver, SnapshotOptions};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Default entry max-age for garbage collection: two days.
pub const DEFAULT_MAX_AGE_MS: u64 = 2 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct PackStrategyOptions {
    /// Base path of the cache; the pack lives at `{cache_location}.pack`.
    pub cache_location: PathBuf,
    /// Opaque producer version; a mismatch on restore starts a fresh pack.
    pub version: String,
    /// Context directory for build-dependency resolution.
    pub context: PathBuf,
    /// Entries idle for longer than this are dropped before a rewrite.
    pub max_age_ms: u64,
}

impl PackStrategyOptions {
    pub fn new(
        cache_location: impl Into<PathBuf>,
        version: impl Into<String>,
        context: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache_location: cache_location.into(),
            version: version.into(),
            context: context.into(),
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }
}

/// Orchestrates pack restore, store, and atomic rewrite.
///
/// Construction restores `{cache_location}.pack` and revalidates its embedded
/// build snapshot; anything unusable degrades to a fresh pack, never an
/// error. Entries accumulate in memory until [`PackFileCacheStrategy::persist`]
/// garbage-collects and rewrites the file.
pub struct PackFileCacheStrategy {
    fs_info: Arc<FileSystemInfo>,
    resolver: Arc<dyn Resolver>,
    module_graph: Arc<dyn ModuleGraph>,
    context: PathBuf,
    pack_path: PathBuf,
    max_age_ms: u64,
    pack: Mutex<Pack>,
}

impl PackFileCacheStrategy {
    pub fn new(
        fs_info: Arc<FileSystemInfo>,
        resolver: Arc<dyn Resolver>,
        module_graph: Arc<dyn ModuleGraph>,
        options: PackStrategyOptions,
    ) -> Self {
        let mut location = options.cache_location.into_os_string();
        location.push(".pack");
        let pack_path = PathBuf::from(location);

        let pack = Self::restore_pack(&pack_path, &options.version, &fs_info);
        Self {
            fs_info,
            resolver,
            module_graph,
            context: options.context,
            pack_path,
            max_age_ms: options.max_age_ms,
            pack: Mutex::new(pack),
        }
    }

    fn restore_pack(path: &Path, version: &str, fs_info: &FileSystemInfo) -> Pack {
        let loaded = match Pack::deserialize_from_file(path, version) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(
                    target = "baler.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to restore pack file; starting with a fresh cache"
                );
                None
            }
        };
        let Some(pack) = loaded else {
            return Pack::new(version);
        };

        let Some(snapshot) = pack.build_snapshot() else {
            tracing::debug!(
                target = "baler.cache",
                path = %path.display(),
                entries = pack.len(),
                "restored pack"
            );
            return pack;
        };

        let start = Instant::now();
        let valid = fs_info.check_snapshot_valid(snapshot);
        tracing::debug!(
            target = "baler.cache",
            path = %path.display(),
            valid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "checked pack build snapshot"
        );
        if valid {
            pack
        } else {
            tracing::debug!(
                target = "baler.cache",
                path = %path.display(),
                "build dependencies changed; starting with a fresh cache"
            );
            Pack::new(version)
        }
    }

    pub fn store(&self, id: &str, etag: &str, data: impl Into<Arc<[u8]>>) {
        self.pack.lock().set(id, etag, data.into());
    }

    pub fn restore(&self, id: &str, etag: &str) -> Result<Option<Arc<[u8]>>, CacheError> {
        self.pack.lock().get(id, etag)
    }

    /// Resolve `deps`, snapshot the result in hash mode, and merge it into
    /// the pack's embedded build snapshot.
    pub fn store_build_dependencies(
        &self,
        deps: impl IntoIterator<Item = String>,
    ) -> Result<(), CacheError> {
        let start = Instant::now();
        let resolved = self.fs_info.resolve_build_dependencies(
            self.resolver.as_ref(),
            self.module_graph.as_ref(),
            &self.context,
            deps,
        )?;

        let files: Vec<PathBuf> = resolved.files.into_iter().collect();
        let directories: Vec<PathBuf> = resolved.directories.into_iter().collect();
        let missing: Vec<PathBuf> = resolved.missing.into_iter().collect();
        let snapshot = self.fs_info.create_snapshot(
            None,
            &files,
            &directories,
            &missing,
            SnapshotOptions { hash: true },
        );
        tracing::debug!(
            target = "baler.cache",
            files = files.len(),
            directories = directories.len(),
            missing = missing.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "captured build dependencies"
        );

        self.pack.lock().merge_build_snapshot(snapshot);
        Ok(())
    }

    /// Garbage-collect and rewrite the pack file; a no-op while the pack
    /// matches what is on disk.
    pub fn persist(&self) -> Result<(), CacheError> {
        let mut pack = self.pack.lock();
        if !pack.is_invalid() {
            return Ok(());
        }

        let start = Instant::now();
        pack.collect_garbage(self.max_age_ms);
        pack.write_to_file(&self.pack_path)?;
        tracing::debug!(
            target = "baler.cache",
            path = %self.pack_path.display(),
            entries = pack.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "wrote pack file"
        );
        Ok(())
    }

    pub fn pack_path(&self) -> &Path {
        &self.pack_path
    }
}
