use baler_cache::{PackFileCacheStrategy, PackStrategyOptions};
use baler_fs::{
    FileSystemInfo, FileSystemInfoOptions, InputFileSystem, MemoryFs, NoModuleGraph, Resolver,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Default)]
struct MapResolver {
    files: BTreeMap<String, PathBuf>,
}

impl MapResolver {
    fn file(mut self, request: &str, path: &str) -> Self {
        self.files.insert(request.to_string(), PathBuf::from(path));
        self
    }
}

impl Resolver for MapResolver {
    fn resolve(&self, _context: &Path, request: &str) -> io::Result<PathBuf> {
        self.files.get(request).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unresolved file: {request}"))
        })
    }

    fn resolve_context(&self, _context: &Path, request: &str) -> io::Result<PathBuf> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unresolved directory: {request}"),
        ))
    }
}

fn app_fs() -> Arc<MemoryFs> {
    let fs = Arc::new(MemoryFs::new());
    fs.set_file("/app/loader.js", 1000, b"loader v1".to_vec());
    fs.set_file("/app/package.json", 1000, br#"{"name":"app"}"#.to_vec());
    fs
}

fn strategy(fs: &Arc<MemoryFs>, cache_dir: &Path, version: &str) -> PackFileCacheStrategy {
    let info = Arc::new(FileSystemInfo::new(
        Arc::clone(fs) as Arc<dyn InputFileSystem>,
        FileSystemInfoOptions::default(),
    ));
    let resolver = Arc::new(MapResolver::default().file("my-loader", "/app/loader.js"));
    PackFileCacheStrategy::new(
        info,
        resolver,
        Arc::new(NoModuleGraph),
        PackStrategyOptions::new(cache_dir.join("cache"), version, "/app"),
    )
}

#[test]
fn store_persist_restore_across_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = app_fs();

    let first = strategy(&fs, tmp.path(), "v1");
    assert_eq!(first.restore("module-a", "etag").unwrap(), None);
    first.store("module-a", "etag", b"artifact".to_vec());
    first.persist().unwrap();
    assert!(first.pack_path().is_file());

    let second = strategy(&fs, tmp.path(), "v1");
    assert_eq!(
        second.restore("module-a", "etag").unwrap().as_deref(),
        Some(&b"artifact"[..])
    );
    // The caller's etag detects caller-side invalidation.
    assert_eq!(second.restore("module-a", "other-etag").unwrap(), None);
}

#[test]
fn version_mismatch_starts_a_fresh_pack() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = app_fs();

    let first = strategy(&fs, tmp.path(), "v1");
    first.store("module-a", "etag", b"artifact".to_vec());
    first.persist().unwrap();

    let second = strategy(&fs, tmp.path(), "v2");
    assert_eq!(second.restore("module-a", "etag").unwrap(), None);
}

#[test]
fn corrupt_pack_file_starts_a_fresh_pack() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = app_fs();
    std::fs::write(tmp.path().join("cache.pack"), b"garbage").unwrap();

    let strategy = strategy(&fs, tmp.path(), "v1");
    assert_eq!(strategy.restore("module-a", "etag").unwrap(), None);
    strategy.store("module-a", "etag", b"artifact".to_vec());
    strategy.persist().unwrap();

    assert!(tmp.path().join("cache.pack").is_file());
}

#[test]
fn build_dependency_snapshot_guards_the_restore() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = app_fs();

    let first = strategy(&fs, tmp.path(), "v1");
    first.store("module-a", "etag", b"artifact".to_vec());
    first
        .store_build_dependencies(["my-loader".to_string()])
        .unwrap();
    first.persist().unwrap();

    // Unchanged build dependencies: the pack is reused.
    let second = strategy(&fs, tmp.path(), "v1");
    assert_eq!(
        second.restore("module-a", "etag").unwrap().as_deref(),
        Some(&b"artifact"[..])
    );

    // A changed loader invalidates the embedded snapshot and the whole pack.
    fs.set_file("/app/loader.js", 2000, b"loader v2".to_vec());
    let third = strategy(&fs, tmp.path(), "v1");
    assert_eq!(third.restore("module-a", "etag").unwrap(), None);
}

#[test]
fn persist_is_a_noop_while_the_pack_is_clean() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = app_fs();

    let first = strategy(&fs, tmp.path(), "v1");
    first.store("module-a", "etag", b"artifact".to_vec());
    first.persist().unwrap();
    let written = std::fs::read(first.pack_path()).unwrap();

    // Restored and untouched: nothing to write.
    let second = strategy(&fs, tmp.path(), "v1");
    assert_eq!(
        second.restore("module-a", "etag").unwrap().as_deref(),
        Some(&b"artifact"[..])
    );
    second.persist().unwrap();
    assert_eq!(std::fs::read(second.pack_path()).unwrap(), written);
}
