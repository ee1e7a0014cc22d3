//! On-disk persistence of compiled programs, keyed by a 64-bit hash of
//! the normalized source.
//!
//! File layout: magic `KIDA`, u16 LE format version, 8-byte source hash,
//! one flags byte (bit 0 = async), then a u32 LE length-prefixed opaque
//! payload. A reader that finds anything unexpected treats the file as a
//! miss and lets the caller recompile.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::lru::CacheStats;
use crate::errors::{Error, Result};

const MAGIC: [u8; 4] = *b"KIDA";
const FORMAT_VERSION: u16 = 1;

const FLAG_ASYNC: u8 = 0b0000_0001;

/// What a cache read hands back to the compiler.
#[derive(Debug, PartialEq, Eq)]
pub struct BytecodeEntry {
    pub source_hash: u64,
    pub is_async: bool,
    pub payload: Vec<u8>,
}

/// A directory of compiled template images.
#[derive(Debug)]
pub struct BytecodeCache {
    directory: PathBuf,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Stable 64-bit hash of normalized template source. Line endings are
/// normalized so checkouts on different platforms share cache entries.
pub fn hash_source(source: &str) -> u64 {
    let normalized = source.replace("\r\n", "\n");
    seahash::hash(normalized.as_bytes())
}

impl BytecodeCache {
    /// Creates the cache, making sure the directory exists.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .map_err(|e| Error::chain(format!("Couldn't create bytecode cache directory {:?}", directory), e))?;
        Ok(BytecodeCache { directory, hits: AtomicU64::new(0), misses: AtomicU64::new(0) })
    }

    fn entry_path(&self, source_hash: u64) -> PathBuf {
        self.directory.join(format!("{:016x}.kidac", source_hash))
    }

    /// Looks up a compiled image. Any decode problem is a miss; torn or
    /// concurrent writes therefore cost a recompile, never an error.
    pub fn get(&self, source_hash: u64) -> Option<BytecodeEntry> {
        let path = self.entry_path(source_hash);
        match read_entry(&path) {
            Ok(Some(entry)) if entry.source_hash == source_hash => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Ok(Some(_)) => {
                debug!(?path, "bytecode entry hash mismatch, ignoring");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(error) => {
                warn!(?path, %error, "unreadable bytecode entry, ignoring");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Writes an entry through a temp file + atomic rename so concurrent
    /// readers never observe a partial file.
    pub fn put(&self, source_hash: u64, is_async: bool, payload: &[u8]) -> Result<()> {
        let mut buffer = Vec::with_capacity(4 + 2 + 8 + 1 + 4 + payload.len());
        buffer.extend_from_slice(&MAGIC);
        buffer.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buffer.extend_from_slice(&source_hash.to_le_bytes());
        buffer.push(if is_async { FLAG_ASYNC } else { 0 });
        buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buffer.extend_from_slice(payload);

        let mut tmp = NamedTempFile::new_in(&self.directory)
            .map_err(|e| Error::chain("Couldn't create bytecode temp file", e))?;
        tmp.write_all(&buffer)
            .map_err(|e| Error::chain("Couldn't write bytecode entry", e))?;
        tmp.persist(self.entry_path(source_hash))
            .map_err(|e| Error::chain("Couldn't persist bytecode entry", e.error))?;
        Ok(())
    }

    pub fn invalidate(&self, source_hash: u64) {
        let _ = fs::remove_file(self.entry_path(source_hash));
    }

    pub fn info(&self) -> CacheStats {
        let size = fs::read_dir(&self.directory)
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0);
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size,
            capacity: usize::MAX,
        }
    }
}

fn read_entry(path: &Path) -> Result<Option<BytecodeEntry>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(Error::io_error(error)),
    };

    if bytes.len() < 4 + 2 + 8 + 1 + 4 {
        return Err(Error::msg("bytecode entry truncated"));
    }
    if bytes[..4] != MAGIC {
        return Err(Error::msg("bytecode entry has a bad magic number"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        debug!(version, expected = FORMAT_VERSION, "bytecode version mismatch");
        return Ok(None);
    }
    let source_hash = u64::from_le_bytes(bytes[6..14].try_into().unwrap());
    let flags = bytes[14];
    let payload_len = u32::from_le_bytes(bytes[15..19].try_into().unwrap()) as usize;
    let payload = &bytes[19..];
    if payload.len() != payload_len {
        return Err(Error::msg("bytecode entry has a bad payload length"));
    }

    Ok(Some(BytecodeEntry {
        source_hash,
        is_async: flags & FLAG_ASYNC != 0,
        payload: payload.to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BytecodeCache::new(dir.path()).unwrap();
        let hash = hash_source("{{ a }}");

        assert!(cache.get(hash).is_none());
        cache.put(hash, true, b"payload").unwrap();
        let entry = cache.get(hash).unwrap();
        assert!(entry.is_async);
        assert_eq!(entry.payload, b"payload");
        assert_eq!(entry.source_hash, hash);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BytecodeCache::new(dir.path()).unwrap();
        let hash = hash_source("x");

        fs::write(cache.entry_path(hash), b"garbage").unwrap();
        assert!(cache.get(hash).is_none());
    }

    #[test]
    fn test_hash_normalizes_line_endings() {
        assert_eq!(hash_source("a\r\nb"), hash_source("a\nb"));
        assert_ne!(hash_source("a"), hash_source("b"));
    }

    #[test]
    fn test_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = BytecodeCache::new(dir.path()).unwrap();
        let hash = hash_source("x");
        cache.put(hash, false, b"p").unwrap();
        cache.invalidate(hash);
        assert!(cache.get(hash).is_none());
    }
}
