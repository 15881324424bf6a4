use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Basic metadata for a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    /// Modification time in milliseconds since the epoch; 0 when unknown.
    pub mtime_ms: i64,
    pub is_file: bool,
    pub is_dir: bool,
}

/// Filesystem abstraction consumed by [`crate::FileSystemInfo`].
///
/// The trait is intentionally small so it can be implemented for different
/// backends (local FS, overlays, test fixtures). Missing paths are reported
/// as `io::ErrorKind::NotFound`.
pub trait InputFileSystem: Send + Sync {
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    /// Reads the file contents as raw bytes.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Lists directory entry names (no paths, no dot entries added).
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Canonicalizes a path, resolving symlinks.
    fn realpath(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Local OS file system implementation.
#[derive(Debug, Clone, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl InputFileSystem for LocalFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = std::fs::metadata(path)?;
        Ok(FileStat {
            mtime_ms: mtime_millis(&meta),
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
        })
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn realpath(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    mtime_ms: i64,
}

#[derive(Debug, Default)]
struct MemoryFsState {
    files: BTreeMap<PathBuf, MemoryFile>,
    dirs: BTreeMap<PathBuf, i64>,
    errors: BTreeMap<PathBuf, io::ErrorKind>,
}

/// Thread-safe in-memory file system used by tests across the workspace.
///
/// Paths are stored normalized (`.`/`..` resolved lexically); there is no
/// symlink support, so `realpath` is normalization plus an existence check.
/// `inject_error` makes every operation on a path fail with the given kind,
/// which is how tests exercise transient read failures.
#[derive(Debug, Default)]
pub struct MemoryFs {
    state: Mutex<MemoryFsState>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file(&self, path: impl AsRef<Path>, mtime_ms: i64, data: impl Into<Vec<u8>>) {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock();
        add_parent_dirs(&mut state, &path);
        state.files.insert(
            path,
            MemoryFile {
                data: data.into(),
                mtime_ms,
            },
        );
    }

    pub fn add_dir(&self, path: impl AsRef<Path>, mtime_ms: i64) {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock();
        add_parent_dirs(&mut state, &path);
        state.dirs.insert(path, mtime_ms);
    }

    pub fn touch(&self, path: impl AsRef<Path>, mtime_ms: i64) {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock();
        if let Some(file) = state.files.get_mut(&path) {
            file.mtime_ms = mtime_ms;
        } else if let Some(mtime) = state.dirs.get_mut(&path) {
            *mtime = mtime_ms;
        }
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock();
        state.files.remove(&path);
        state.dirs.remove(&path);
        let children: Vec<PathBuf> = state
            .files
            .keys()
            .chain(state.dirs.keys())
            .filter(|p| p.starts_with(&path))
            .cloned()
            .collect();
        for child in children {
            state.files.remove(&child);
            state.dirs.remove(&child);
        }
    }

    /// Make every operation on `path` fail with the given error kind.
    pub fn inject_error(&self, path: impl AsRef<Path>, kind: io::ErrorKind) {
        let path = normalize(path.as_ref());
        self.state.lock().errors.insert(path, kind);
    }

    pub fn clear_error(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        self.state.lock().errors.remove(&path);
    }

    fn check_error(state: &MemoryFsState, path: &Path) -> io::Result<()> {
        match state.errors.get(path) {
            Some(kind) => Err(io::Error::new(*kind, "injected error")),
            None => Ok(()),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn add_parent_dirs(state: &mut MemoryFsState, path: &Path) {
    let mut ancestor = path.parent();
    while let Some(dir) = ancestor {
        if dir.as_os_str().is_empty() {
            break;
        }
        state.dirs.entry(dir.to_path_buf()).or_insert(0);
        ancestor = dir.parent();
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such path: {}", path.display()))
}

impl InputFileSystem for MemoryFs {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let path = normalize(path);
        let state = self.state.lock();
        Self::check_error(&state, &path)?;
        if let Some(file) = state.files.get(&path) {
            return Ok(FileStat {
                mtime_ms: file.mtime_ms,
                is_file: true,
                is_dir: false,
            });
        }
        if let Some(mtime) = state.dirs.get(&path) {
            return Ok(FileStat {
                mtime_ms: *mtime,
                is_file: false,
                is_dir: true,
            });
        }
        Err(not_found(&path))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let path = normalize(path);
        let state = self.state.lock();
        Self::check_error(&state, &path)?;
        match state.files.get(&path) {
            Some(file) => Ok(file.data.clone()),
            None => Err(not_found(&path)),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let path = normalize(path);
        let state = self.state.lock();
        Self::check_error(&state, &path)?;
        if !state.dirs.contains_key(&path) {
            return Err(not_found(&path));
        }
        let mut names = Vec::new();
        for candidate in state.files.keys().chain(state.dirs.keys()) {
            if candidate.parent() == Some(path.as_path()) {
                if let Some(name) = candidate.file_name() {
                    let name = name.to_string_lossy().into_owned();
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        Ok(names)
    }

    fn realpath(&self, path: &Path) -> io::Result<PathBuf> {
        let path = normalize(path);
        let state = self.state.lock();
        Self::check_error(&state, &path)?;
        if state.files.contains_key(&path) || state.dirs.contains_key(&path) {
            Ok(path)
        } else {
            Err(not_found(&path))
        }
    }
}
