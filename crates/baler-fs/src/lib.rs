//! Filesystem facts for incremental builds.
//!
//! This crate tracks the identity and freshness of files, directories, and
//! missing paths referenced during a build:
//! - per-path timestamp and content-hash caches behind coalescing job queues
//! - snapshots of such facts tied to a start time, with merge and
//!   revalidation against the current filesystem
//! - managed-path folding (package directories summarized as `name@version`)
//! - build-dependency resolution into file/directory/missing path sets
//!
//! The filesystem itself is abstracted behind [`InputFileSystem`]; module
//! resolution behind [`Resolver`] and [`ModuleGraph`].

mod accuracy;
mod entry;
mod error;
mod fs;
mod hash;
mod info;
mod managed;
mod queue;
mod resolve;
mod snapshot;

pub use accuracy::AccuracyEstimator;
pub use entry::{SnapshotEntry, TimestampEntry};
pub use error::{FsInfoError, Result};
pub use fs::{FileStat, InputFileSystem, LocalFs, MemoryFs};
pub use hash::ContentHash;
pub use info::{FileSystemInfo, FileSystemInfoOptions, SnapshotOptions};
pub use queue::JobQueue;
pub use resolve::{ModuleGraph, NoModuleGraph, ResolvedBuildDependencies, Resolver};
pub use snapshot::Snapshot;
