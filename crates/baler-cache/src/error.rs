pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by pack persistence.
///
/// Most failure modes never surface here: a pack that fails to load degrades
/// to a fresh pack, and per-entry serialization failures degrade to dropped
/// entries.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("file system info error: {0}")]
    FsInfo(#[from] baler_fs::FsInfoError),
}
