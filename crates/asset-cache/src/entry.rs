//! Cache entries and the strong handles callers hold on them

use std::any::Any;
use std::fmt;
use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::CacheInner;

/// A single cached blob and its metadata.
///
/// Entries are created by [`FileCache`](crate::FileCache), never by callers.
/// While any [`FileHandle`] is live the entry is in use and invisible to
/// eviction; when the last handle drops the entry re-enters the cache's
/// unused pool instead of being destroyed. Destruction happens only once the
/// cache has detached the entry (eviction or shutdown), and unlinks the
/// backing file unless the entry was flagged for retention.
pub struct CacheEntry {
    key: String,
    path: PathBuf,
    length: u64,
    extra: Option<Box<dyn Any + Send + Sync>>,
    /// Owning cache, or `None` once detached.
    pub(crate) back: Mutex<Option<Weak<CacheInner>>>,
    /// Sequence assigned on each entry into the unused pool. Smallest = oldest.
    pub(crate) lru_seq: AtomicU64,
    /// Number of external strong handles currently live.
    pub(crate) handles: AtomicUsize,
    /// Whether the entry currently sits in the unused pool.
    pub(crate) pooled: AtomicBool,
    /// Set during shutdown to keep the backing file on disk.
    pub(crate) persist: AtomicBool,
}

impl CacheEntry {
    pub(crate) fn new(
        key: String,
        path: PathBuf,
        length: u64,
        extra: Option<Box<dyn Any + Send + Sync>>,
        back: Weak<CacheInner>,
    ) -> Self {
        Self {
            key,
            path,
            length,
            extra,
            back: Mutex::new(Some(back)),
            lru_seq: AtomicU64::new(0),
            handles: AtomicUsize::new(0),
            pooled: AtomicBool::new(false),
            persist: AtomicBool::new(false),
        }
    }

    /// The entry's key, also the filename stem on disk.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Absolute path of the backing file.
    pub fn filepath(&self) -> &Path {
        &self.path
    }

    /// Byte size of the blob.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Opaque payload installed at write time, if any.
    pub fn extra(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.extra.as_deref()
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        if self.persist.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Unlinked {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("Failed to unlink {} ({e})", self.path.display()),
        }
    }
}

/// Strong, caller-facing handle to a [`CacheEntry`].
///
/// Cloning is cheap. Dropping the last clone hands the entry back to the
/// owning cache, which re-inserts it into the unused pool; if the cache has
/// already detached the entry, destruction proceeds and the backing file is
/// unlinked unless flagged to persist.
#[derive(Debug)]
pub struct FileHandle {
    entry: Arc<CacheEntry>,
}

impl FileHandle {
    /// Wrap an entry whose external-handle count the caller has already
    /// bumped under the index lock.
    pub(crate) fn from_counted(entry: Arc<CacheEntry>) -> Self {
        Self { entry }
    }
}

impl Clone for FileHandle {
    fn clone(&self) -> Self {
        self.entry.handles.fetch_add(1, Ordering::AcqRel);
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl Deref for FileHandle {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.entry
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.entry.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last external handle. Hand the entry back to the cache while it
        // still owns us; otherwise the Arc runs down and the entry dies.
        let back = self.entry.back.lock().clone();
        if let Some(cache) = back.and_then(|weak| weak.upgrade()) {
            cache.release(Arc::clone(&self.entry));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_entry(path: PathBuf, length: u64) -> CacheEntry {
        let entry = CacheEntry::new("k".to_owned(), path, length, None, Weak::new());
        *entry.back.lock() = None;
        entry
    }

    #[test]
    fn drop_unlinks_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.bin");
        fs::write(&path, b"abc").unwrap();

        drop(detached_entry(path.clone(), 3));
        assert!(!path.exists());
    }

    #[test]
    fn drop_keeps_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.bin");
        fs::write(&path, b"abc").unwrap();

        let entry = detached_entry(path.clone(), 3);
        entry.persist.store(true, Ordering::Release);
        drop(entry);
        assert!(path.exists());
    }

    #[test]
    fn drop_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        drop(detached_entry(dir.path().join("gone.bin"), 0));
    }
}
