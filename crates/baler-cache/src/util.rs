use crate::error::CacheError;
use bincode::Options;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard upper bound for any single payload we will write to or read from a
/// pack file.
///
/// Cache corruption should degrade to a fresh pack, not an out-of-memory
/// crash: a corrupted length prefix must not be able to request an enormous
/// allocation. Entries larger than this are dropped at serialize time.
pub const PACK_PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_options_limited() -> impl bincode::Options {
    bincode_options().with_limit(PACK_PAYLOAD_LIMIT_BYTES as u64)
}

static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write a file atomically: stream into a staging file next to the
/// destination, sync, then rename over it.
///
/// Staging in the same directory keeps the rename on one filesystem; the
/// `pid.seq.tmp` suffix keeps concurrent processes out of each other's way.
pub fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => return Err(io::Error::new(io::ErrorKind::Other, "path has no parent").into()),
    };
    fs::create_dir_all(parent)?;

    let (staging, mut file) = loop {
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let candidate: PathBuf =
            path.with_extension(format!("{pid}.{seq}.tmp", pid = std::process::id()));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => break (candidate, file),
            // A crashed writer can leave its staging file behind; step past it.
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    };

    let written = write(&mut file).and_then(|()| file.sync_all().map_err(CacheError::from));
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }

    fs::rename(&staging, path).map_err(|err| {
        let _ = fs::remove_file(&staging);
        CacheError::from(err)
    })
}

/// Writer wrapper tracking the number of bytes written, used to record lazy
/// payload offsets while streaming a pack file.
pub struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader wrapper tracking the stream position, used to record lazy payload
/// offsets while decoding a pack file.
pub struct CountingReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Skip exactly `len` bytes.
    pub fn skip(&mut self, len: u64) -> io::Result<()> {
        let copied = io::copy(&mut self.by_ref().take(len), &mut io::sink())?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated payload",
            ));
        }
        Ok(())
    }

    /// Whether any bytes remain past the current position.
    pub fn has_trailing_bytes(&mut self) -> io::Result<bool> {
        let mut probe = [0u8; 1];
        Ok(self.read(&mut probe)? > 0)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}
