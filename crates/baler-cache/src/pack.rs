use crate::error::CacheError;
use crate::util::{
    bincode_options, bincode_options_limited, now_millis, CountingReader, CountingWriter,
    PACK_PAYLOAD_LIMIT_BYTES,
};
use baler_fs::Snapshot;
use bincode::Options;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entries whose serialized size exceeds this are written as lazy loaders
/// instead of inline payloads.
pub const MAX_INLINE_SIZE: u64 = 20_000;

/// Bumped whenever the on-disk layout changes; a mismatch reads as a fresh
/// pack.
pub const PACK_SCHEMA_VERSION: u32 = 1;

const ENTRY_INLINE: u8 = 0;
const ENTRY_LAZY: u8 = 1;

/// A deferred pack payload: a slice of the pack file read on first access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyEntry {
    path: PathBuf,
    offset: u64,
    len: u64,
    size: u64,
}

impl LazyEntry {
    pub fn size(&self) -> u64 {
        self.size
    }

    fn load(&self) -> Result<Vec<u8>, CacheError> {
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = vec![0u8; self.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Debug, Clone)]
enum PackContent {
    Inline(Arc<[u8]>),
    Lazy(LazyEntry),
}

/// Keyed in-memory artifact store with a two-tier on-disk representation.
///
/// Entries carry an opaque etag supplied by the caller; `get` misses on etag
/// mismatch. `invalid` is true exactly when the in-memory pack differs from
/// what is on disk; [`Pack::write_to_file`] clears it.
#[derive(Debug)]
pub struct Pack {
    version: String,
    etags: BTreeMap<String, String>,
    content: BTreeMap<String, PackContent>,
    last_access: BTreeMap<String, u64>,
    last_sizes: BTreeMap<String, u64>,
    unserializable: BTreeSet<String>,
    used: BTreeSet<String>,
    invalid: bool,
    build_snapshot: Option<Snapshot>,
}

impl Pack {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            etags: BTreeMap::new(),
            content: BTreeMap::new(),
            last_access: BTreeMap::new(),
            last_sizes: BTreeMap::new(),
            unserializable: BTreeSet::new(),
            used: BTreeSet::new(),
            invalid: false,
            build_snapshot: None,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn build_snapshot(&self) -> Option<&Snapshot> {
        self.build_snapshot.as_ref()
    }

    pub fn last_access(&self) -> &BTreeMap<String, u64> {
        &self.last_access
    }

    pub fn is_unserializable(&self, id: &str) -> bool {
        self.unserializable.contains(id)
    }

    /// Whether the entry currently holds its payload in memory; `None` when
    /// the id has no content.
    pub fn entry_is_inline(&self, id: &str) -> Option<bool> {
        self.content.get(id).map(|content| match content {
            PackContent::Inline(_) => true,
            PackContent::Lazy(_) => false,
        })
    }

    /// Merge a build snapshot into the pack's embedded one.
    pub fn merge_build_snapshot(&mut self, snapshot: Snapshot) {
        self.build_snapshot = Some(match self.build_snapshot.take() {
            Some(existing) => Snapshot::merge(existing, snapshot),
            None => snapshot,
        });
        self.invalid = true;
    }

    /// Look up an entry. Misses on unknown id or etag mismatch; a lazy entry
    /// is materialized from disk and migrated inline when small enough.
    pub fn get(&mut self, id: &str, etag: &str) -> Result<Option<Arc<[u8]>>, CacheError> {
        match self.etags.get(id) {
            Some(stored) if stored == etag => {}
            _ => return Ok(None),
        }
        let lazy = match self.content.get(id) {
            Some(PackContent::Inline(data)) => {
                self.used.insert(id.to_string());
                return Ok(Some(Arc::clone(data)));
            }
            Some(PackContent::Lazy(lazy)) => lazy.clone(),
            None => return Ok(None),
        };
        self.used.insert(id.to_string());

        let data: Arc<[u8]> = Arc::from(lazy.load()?);
        self.last_sizes.insert(id.to_string(), lazy.size);
        if lazy.size <= MAX_INLINE_SIZE {
            self.invalid = true;
            tracing::debug!(
                target = "baler.cache",
                id,
                size = lazy.size,
                "entry shrank below the inline threshold; storing inline on next write"
            );
            self.content
                .insert(id.to_string(), PackContent::Inline(Arc::clone(&data)));
        }
        Ok(Some(data))
    }

    /// Insert or replace an entry. A silent no-op for ids previously found to
    /// be unserializable.
    pub fn set(&mut self, id: &str, etag: &str, data: Arc<[u8]>) {
        if self.unserializable.contains(id) {
            return;
        }
        self.used.insert(id.to_string());
        self.invalid = true;
        self.etags.insert(id.to_string(), etag.to_string());
        self.content.insert(id.to_string(), PackContent::Inline(data));
    }

    /// Roll `used` into `last_access`, then drop every entry idle for longer
    /// than `max_age_ms`.
    pub fn collect_garbage(&mut self, max_age_ms: u64) {
        let now = now_millis();
        let used = std::mem::take(&mut self.used);
        for id in used {
            self.last_access.insert(id, now);
        }

        let expired: Vec<String> = self
            .last_access
            .iter()
            .filter(|(_, at)| now.saturating_sub(**at) > max_age_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.last_access.remove(&id);
            self.etags.remove(&id);
            self.content.remove(&id);
        }
    }

    /// Atomically rewrite the pack file and mark the pack clean.
    pub fn write_to_file(&mut self, path: &Path) -> Result<(), CacheError> {
        crate::util::atomic_write_with(path, |file| {
            let mut writer = CountingWriter::new(BufWriter::new(file));
            self.serialize_into(&mut writer, path)?;
            writer.flush()?;
            Ok(())
        })?;
        self.invalid = false;
        Ok(())
    }

    /// Stream the pack into `writer`.
    ///
    /// `final_path` is where the bytes will live after the atomic rename;
    /// in-memory lazy entries are re-pointed at it so they stay readable once
    /// the old file is overwritten. Lazy payloads are copied through memory
    /// for the same reason: the on-disk payload must be self-contained.
    pub fn serialize_into<W: Write>(
        &mut self,
        writer: &mut CountingWriter<W>,
        final_path: &Path,
    ) -> Result<(), CacheError> {
        let now = now_millis();
        let used = std::mem::take(&mut self.used);
        for id in used {
            self.last_access.insert(id, now);
        }

        let mut opts = bincode_options();
        (&mut opts).serialize_into(&mut *writer, &PACK_SCHEMA_VERSION)?;
        (&mut opts).serialize_into(&mut *writer, &self.version)?;
        (&mut opts).serialize_into(&mut *writer, &self.etags)?;
        (&mut opts).serialize_into(&mut *writer, &self.unserializable)?;
        (&mut opts).serialize_into(&mut *writer, &self.last_access)?;
        (&mut opts).serialize_into(&mut *writer, &self.build_snapshot)?;

        let ids: Vec<String> = self.content.keys().cloned().collect();
        for id in ids {
            let (data, measured, tier_size) = match self.content.get(&id) {
                Some(PackContent::Inline(data)) => {
                    let measured = data.len() as u64;
                    // The tier is chosen by the last measured size, not the
                    // current payload; a stale measurement is corrected by the
                    // reader on the next load.
                    let tier_size = self.last_sizes.get(&id).copied().unwrap_or(measured);
                    (Arc::clone(data), measured, tier_size)
                }
                Some(PackContent::Lazy(lazy)) => {
                    // Already-lazy entries are re-emitted as lazy.
                    (Arc::from(lazy.load()?), lazy.size, u64::MAX)
                }
                None => continue,
            };

            (&mut opts).serialize_into(&mut *writer, &Some(id.as_str()))?;
            if measured > PACK_PAYLOAD_LIMIT_BYTES as u64 {
                (&mut opts).serialize_into(&mut *writer, &false)?;
                tracing::debug!(
                    target = "baler.cache",
                    id = %id,
                    size = measured,
                    "entry exceeds the serializable payload limit; dropping"
                );
                continue;
            }
            (&mut opts).serialize_into(&mut *writer, &true)?;

            if tier_size <= MAX_INLINE_SIZE {
                (&mut opts).serialize_into(&mut *writer, &ENTRY_INLINE)?;
                (&mut opts).serialize_into(&mut *writer, &measured)?;
                (&mut opts).serialize_into(&mut *writer, &data.as_ref())?;
            } else {
                (&mut opts).serialize_into(&mut *writer, &ENTRY_LAZY)?;
                (&mut opts).serialize_into(&mut *writer, &measured)?;
                (&mut opts).serialize_into(&mut *writer, &(data.len() as u64))?;
                let offset = writer.written();
                writer.write_all(&data)?;
                self.content.insert(
                    id.clone(),
                    PackContent::Lazy(LazyEntry {
                        path: final_path.to_path_buf(),
                        offset,
                        len: data.len() as u64,
                        size: measured,
                    }),
                );
            }
            self.last_sizes.insert(id, measured);
        }
        (&mut opts).serialize_into(&mut *writer, &None::<String>)?;
        Ok(())
    }

    /// Decode a pack file.
    ///
    /// Returns `Ok(None)` for a missing file and for any unusable payload
    /// (corruption, schema or version mismatch, trailing bytes from a newer
    /// layout); the caller starts a fresh pack. Only I/O errors opening the
    /// file surface as errors.
    pub fn deserialize_from_file(
        path: &Path,
        expected_version: &str,
    ) -> Result<Option<Pack>, CacheError> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut reader = CountingReader::new(std::io::BufReader::new(file));
        let mut opts = bincode_options_limited();

        macro_rules! stage {
            ($read:expr, $stage:literal) => {
                match $read {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::debug!(
                            target = "baler.cache",
                            path = %path.display(),
                            stage = $stage,
                            error = %err,
                            "failed to decode pack file"
                        );
                        return Ok(None);
                    }
                }
            };
        }

        let schema_version: u32 = stage!((&mut opts).deserialize_from(&mut reader), "schema_version");
        if schema_version != PACK_SCHEMA_VERSION {
            tracing::debug!(
                target = "baler.cache",
                path = %path.display(),
                found = schema_version,
                expected = PACK_SCHEMA_VERSION,
                "pack schema version mismatch"
            );
            return Ok(None);
        }
        let version: String = stage!((&mut opts).deserialize_from(&mut reader), "version");
        if version != expected_version {
            tracing::debug!(
                target = "baler.cache",
                path = %path.display(),
                found = %version,
                expected = %expected_version,
                "pack version mismatch"
            );
            return Ok(None);
        }
        let etags: BTreeMap<String, String> = stage!((&mut opts).deserialize_from(&mut reader), "etags");
        let mut unserializable: BTreeSet<String> =
            stage!((&mut opts).deserialize_from(&mut reader), "unserializable");
        let last_access: BTreeMap<String, u64> =
            stage!((&mut opts).deserialize_from(&mut reader), "last_access");
        let build_snapshot: Option<Snapshot> =
            stage!((&mut opts).deserialize_from(&mut reader), "build_snapshot");

        let mut content = BTreeMap::new();
        let mut last_sizes = BTreeMap::new();
        let mut invalid = false;
        loop {
            let id: Option<String> = stage!((&mut opts).deserialize_from(&mut reader), "entry_id");
            let Some(id) = id else { break };
            let has_data: bool = stage!((&mut opts).deserialize_from(&mut reader), "entry_flag");
            if !has_data {
                // The writer dropped this entry; future sets of the id no-op.
                unserializable.insert(id);
                continue;
            }
            let tag: u8 = stage!((&mut opts).deserialize_from(&mut reader), "entry_tag");
            match tag {
                ENTRY_INLINE => {
                    let size: u64 = stage!((&mut opts).deserialize_from(&mut reader), "entry_size");
                    let data: Vec<u8> = stage!((&mut opts).deserialize_from(&mut reader), "entry_data");
                    last_sizes.insert(id.clone(), size);
                    if size > MAX_INLINE_SIZE {
                        invalid = true;
                        tracing::debug!(
                            target = "baler.cache",
                            id = %id,
                            size,
                            "entry outgrew the inline threshold; storing lazily on next write"
                        );
                    }
                    content.insert(id, PackContent::Inline(Arc::from(data)));
                }
                ENTRY_LAZY => {
                    let size: u64 = stage!((&mut opts).deserialize_from(&mut reader), "entry_size");
                    let len: u64 = stage!((&mut opts).deserialize_from(&mut reader), "entry_len");
                    if len > PACK_PAYLOAD_LIMIT_BYTES as u64 {
                        tracing::debug!(
                            target = "baler.cache",
                            path = %path.display(),
                            id = %id,
                            len,
                            "lazy payload exceeds the payload limit"
                        );
                        return Ok(None);
                    }
                    let offset = reader.position();
                    stage!(reader.skip(len), "entry_payload");
                    content.insert(
                        id,
                        PackContent::Lazy(LazyEntry {
                            path: path.to_path_buf(),
                            offset,
                            len,
                            size,
                        }),
                    );
                }
                other => {
                    tracing::debug!(
                        target = "baler.cache",
                        path = %path.display(),
                        tag = other,
                        "unknown pack entry tag"
                    );
                    return Ok(None);
                }
            }
        }

        // Unknown trailing data means a newer producer appended fields we
        // don't understand; treat like a version mismatch.
        let trailing = stage!(reader.has_trailing_bytes(), "trailing");
        if trailing {
            tracing::debug!(
                target = "baler.cache",
                path = %path.display(),
                "pack file has trailing bytes"
            );
            return Ok(None);
        }

        Ok(Some(Pack {
            version,
            etags,
            content,
            last_access,
            last_sizes,
            unserializable,
            used: BTreeSet::new(),
            invalid,
            build_snapshot,
        }))
    }
}
