use baler_cache::{Pack, PACK_SCHEMA_VERSION};
use baler_fs::{Snapshot, SnapshotEntry, TimestampEntry};
use bincode::Options;
use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn bytes(data: &[u8]) -> Arc<[u8]> {
    Arc::from(data.to_vec())
}

fn load(path: &Path, version: &str) -> Pack {
    Pack::deserialize_from_file(path, version)
        .expect("read pack")
        .expect("usable pack")
}

fn sample_snapshot() -> Snapshot {
    let mut snapshot = Snapshot {
        start_time: Some(1234),
        ..Default::default()
    };
    snapshot.file_timestamps.insert(
        PathBuf::from("/src/a.js"),
        SnapshotEntry::Present(TimestampEntry {
            safe_time: 100,
            timestamp: Some(50),
        }),
    );
    snapshot
        .managed_items
        .insert(PathBuf::from("/node_modules/p"), SnapshotEntry::Present("p@1.0.0".into()));
    snapshot
}

#[test]
fn round_trip_preserves_entries_and_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");

    let mut pack = Pack::new("v1");
    pack.set("module-a", "etag-a", bytes(b"artifact a"));
    pack.set("module-b", "etag-b", bytes(b"artifact b"));
    pack.merge_build_snapshot(sample_snapshot());
    pack.write_to_file(&path).unwrap();
    assert!(!pack.is_invalid());

    let mut loaded = load(&path, "v1");
    assert_eq!(loaded.version(), "v1");
    assert_eq!(loaded.len(), 2);
    assert!(!loaded.is_invalid());
    assert_eq!(loaded.build_snapshot(), Some(&sample_snapshot()));
    // `used` was drained into access times at serialize time.
    assert!(loaded.last_access().contains_key("module-a"));
    assert!(loaded.last_access().contains_key("module-b"));

    assert_eq!(
        loaded.get("module-a", "etag-a").unwrap().as_deref(),
        Some(&b"artifact a"[..])
    );
    assert_eq!(loaded.get("module-a", "stale-etag").unwrap(), None);
}

#[test]
fn large_entries_round_trip_as_lazy_loaders() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");
    let payload = vec![42u8; 30_000];

    let mut pack = Pack::new("v1");
    pack.set("big", "e", bytes(&payload));
    pack.set("small", "e", bytes(b"tiny"));
    pack.write_to_file(&path).unwrap();

    // The in-memory pack was re-pointed at the rewritten file and stays
    // readable.
    assert_eq!(pack.entry_is_inline("big"), Some(false));
    assert_eq!(pack.get("big", "e").unwrap().as_deref(), Some(&payload[..]));

    let mut loaded = load(&path, "v1");
    assert_eq!(loaded.entry_is_inline("big"), Some(false));
    assert_eq!(loaded.entry_is_inline("small"), Some(true));
    assert!(!loaded.is_invalid());

    // Materializing a genuinely large entry does not trigger a migration.
    assert_eq!(loaded.get("big", "e").unwrap().as_deref(), Some(&payload[..]));
    assert!(!loaded.is_invalid());
}

#[test]
fn lazy_entries_survive_rewrites_without_being_touched() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");
    let payload = vec![7u8; 25_000];

    let mut pack = Pack::new("v1");
    pack.set("big", "e", bytes(&payload));
    pack.write_to_file(&path).unwrap();

    let mut loaded = load(&path, "v1");
    loaded.set("other", "e", bytes(b"x"));
    // `big` is still a lazy loader; the rewrite must carry its payload over.
    loaded.write_to_file(&path).unwrap();

    let mut reloaded = load(&path, "v1");
    assert_eq!(reloaded.get("big", "e").unwrap().as_deref(), Some(&payload[..]));
}

#[test]
fn entry_growing_past_the_inline_threshold_migrates_to_lazy() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");

    let mut pack = Pack::new("v1");
    pack.set("entry", "e1", bytes(&vec![1u8; 100]));
    pack.write_to_file(&path).unwrap();

    // Replace the payload with one far over the threshold. The tier is chosen
    // by the last measured size, so the next write still emits it inline.
    let mut second = load(&path, "v1");
    assert_eq!(second.entry_is_inline("entry"), Some(true));
    second.set("entry", "e2", bytes(&vec![2u8; 50_000]));
    second.write_to_file(&path).unwrap();

    // The reader sees an inline entry whose measured size straddles the
    // threshold and schedules the migration.
    let mut third = load(&path, "v1");
    assert!(third.is_invalid());
    assert_eq!(third.entry_is_inline("entry"), Some(true));
    third.write_to_file(&path).unwrap();

    let mut fourth = load(&path, "v1");
    assert!(!fourth.is_invalid());
    assert_eq!(fourth.entry_is_inline("entry"), Some(false));
    assert_eq!(
        fourth.get("entry", "e2").unwrap().map(|d| d.len()),
        Some(50_000)
    );
}

#[test]
fn entry_shrinking_below_the_inline_threshold_migrates_to_inline() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");

    let mut pack = Pack::new("v1");
    pack.set("entry", "e", bytes(&vec![1u8; 30_000]));
    pack.write_to_file(&path).unwrap();
    // The stale 30k measurement keeps the lazy tier for the now-small
    // payload.
    pack.set("entry", "e", bytes(&vec![2u8; 50]));
    pack.write_to_file(&path).unwrap();

    let mut loaded = load(&path, "v1");
    assert_eq!(loaded.entry_is_inline("entry"), Some(false));

    // Materializing it reveals the shrink and splices the data back inline.
    let data = loaded.get("entry", "e").unwrap().unwrap();
    assert_eq!(data.len(), 50);
    assert!(loaded.is_invalid());
    assert_eq!(loaded.entry_is_inline("entry"), Some(true));

    loaded.write_to_file(&path).unwrap();
    let reloaded = load(&path, "v1");
    assert!(!reloaded.is_invalid());
    assert_eq!(reloaded.entry_is_inline("entry"), Some(true));
}

#[test]
fn version_mismatch_reads_as_no_pack() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");

    let mut pack = Pack::new("v1");
    pack.set("a", "e", bytes(b"data"));
    pack.write_to_file(&path).unwrap();

    assert!(Pack::deserialize_from_file(&path, "v2").unwrap().is_none());
    assert!(Pack::deserialize_from_file(&path, "v1").unwrap().is_some());
}

#[test]
fn corrupt_file_reads_as_no_pack() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");
    std::fs::write(&path, b"definitely not a pack").unwrap();

    assert!(Pack::deserialize_from_file(&path, "v1").unwrap().is_none());
}

#[test]
fn missing_file_reads_as_no_pack() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");
    assert!(Pack::deserialize_from_file(&path, "v1").unwrap().is_none());
}

#[test]
fn trailing_bytes_read_as_no_pack() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");

    let mut pack = Pack::new("v1");
    pack.set("a", "e", bytes(b"data"));
    pack.write_to_file(&path).unwrap();

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0u8]).unwrap();
    drop(file);

    // Unknown trailing fields from a newer producer degrade to a fresh pack.
    assert!(Pack::deserialize_from_file(&path, "v1").unwrap().is_none());
}

fn craft_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// Hand-write a pack file header followed by the given raw entry records.
fn craft_pack_file(
    path: &Path,
    etags: &[(&str, &str)],
    last_access: &[(&str, u64)],
    write_entries: impl FnOnce(&mut Vec<u8>),
) {
    let mut opts = craft_options();
    let mut out = Vec::new();
    (&mut opts).serialize_into(&mut out, &PACK_SCHEMA_VERSION).unwrap();
    (&mut opts).serialize_into(&mut out, "v1").unwrap();
    let etags: BTreeMap<String, String> = etags
        .iter()
        .map(|(id, etag)| (id.to_string(), etag.to_string()))
        .collect();
    (&mut opts).serialize_into(&mut out, &etags).unwrap();
    (&mut opts).serialize_into(&mut out, &BTreeSet::<String>::new()).unwrap();
    let last_access: BTreeMap<String, u64> = last_access
        .iter()
        .map(|(id, at)| (id.to_string(), *at))
        .collect();
    (&mut opts).serialize_into(&mut out, &last_access).unwrap();
    (&mut opts).serialize_into(&mut out, &None::<Snapshot>).unwrap();
    write_entries(&mut out);
    (&mut opts).serialize_into(&mut out, &None::<String>).unwrap();
    std::fs::write(path, out).unwrap();
}

#[test]
fn no_data_records_mark_the_id_unserializable() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");
    let mut opts = craft_options();

    craft_pack_file(&path, &[("a", "e")], &[], |out| {
        (&mut opts).serialize_into(&mut *out, &Some("a")).unwrap();
        (&mut opts).serialize_into(&mut *out, &false).unwrap();
    });

    let mut pack = load(&path, "v1");
    assert!(pack.is_unserializable("a"));
    assert_eq!(pack.get("a", "e").unwrap(), None);

    // Future sets of the id are silent no-ops.
    pack.set("a", "e", bytes(b"new data"));
    assert_eq!(pack.len(), 0);
    assert_eq!(pack.get("a", "e").unwrap(), None);
}

#[test]
fn collect_garbage_drops_entries_past_max_age() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("cache.pack");
    let mut opts = craft_options();

    // `old` was last accessed at the epoch; `fresh` gets used after loading.
    craft_pack_file(&path, &[("old", "e"), ("fresh", "e")], &[("old", 0)], |out| {
        for id in ["old", "fresh"] {
            (&mut opts).serialize_into(&mut *out, &Some(id)).unwrap();
            (&mut opts).serialize_into(&mut *out, &true).unwrap();
            (&mut opts).serialize_into(&mut *out, &0u8).unwrap();
            (&mut opts).serialize_into(&mut *out, &4u64).unwrap();
            (&mut opts).serialize_into(&mut *out, &b"data".to_vec()).unwrap();
        }
    });

    let mut pack = load(&path, "v1");
    assert_eq!(pack.len(), 2);
    assert_eq!(pack.get("fresh", "e").unwrap().as_deref(), Some(&b"data"[..]));

    pack.collect_garbage(60_000);
    assert_eq!(pack.len(), 1);
    assert_eq!(pack.get("old", "e").unwrap(), None);
    assert_eq!(pack.get("fresh", "e").unwrap().as_deref(), Some(&b"data"[..]));
}
