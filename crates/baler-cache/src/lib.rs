//! Persistable pack cache for incremental builds.
//!
//! A [`Pack`] is a keyed in-memory artifact store — `(identifier → etag,
//! data)` with per-entry access times — serialized into a single pack file
//! with a two-tier representation: small entries inline, large entries as
//! lazy loaders read on demand. [`PackFileCacheStrategy`] orchestrates the
//! lifecycle: restore (guarded by a build-dependency snapshot revalidated
//! through `baler-fs`), store, garbage collection, and atomic rewrite.
//!
//! What to cache is the caller's policy; this crate only keeps the supplied
//! triples alive across processes.

mod error;
mod pack;
mod strategy;
mod util;

pub use error::{CacheError, Result};
pub use pack::{LazyEntry, Pack, MAX_INLINE_SIZE, PACK_SCHEMA_VERSION};
pub use strategy::{PackFileCacheStrategy, PackStrategyOptions, DEFAULT_MAX_AGE_MS};
pub use util::{atomic_write_with, now_millis, CountingReader, CountingWriter, PACK_PAYLOAD_LIMIT_BYTES};
