use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, FsInfoError>;

/// Errors produced by filesystem fact reads and build-dependency resolution.
///
/// Values are cheap to clone so a single failed read can be delivered to every
/// waiter coalesced onto the same job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FsInfoError {
    /// A filesystem read failed with something other than `NotFound`.
    ///
    /// `NotFound` never surfaces here: a missing path is a valid negative fact.
    /// The exception is managed-item manifests, where a missing `package.json`
    /// is a failed read.
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: Arc<io::Error>,
    },

    #[error("invalid package manifest {path:?}: {message}")]
    Manifest { path: PathBuf, message: String },

    #[error("failed to resolve {request} in {context:?}: {source}")]
    Resolve {
        context: PathBuf,
        request: String,
        source: Arc<io::Error>,
    },

    /// The owning `FileSystemInfo` was dropped while a job was still queued.
    #[error("file system info dropped while jobs were in flight")]
    ShutDown,
}

impl FsInfoError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn resolve(context: &Path, request: &str, source: io::Error) -> Self {
        Self::Resolve {
            context: context.to_path_buf(),
            request: request.to_string(),
            source: Arc::new(source),
        }
    }
}
