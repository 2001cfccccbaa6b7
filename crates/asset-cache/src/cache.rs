//! Keyed on-disk blob cache with LRU eviction and restart persistence
//!
//! One [`FileCache`] owns one directory. Blobs live as `<dir>/<key>.<ext>`
//! and are handed out as [`FileHandle`]s. Entries with no live handle sit in
//! an LRU pool bounded by the unused-bytes ceiling; at shutdown the pool is
//! trimmed from its oldest end until what remains fits the offline ceiling,
//! a manifest names the survivors, and at startup everything else in the
//! directory is swept out.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{CacheConfig, MANIFEST_NAME, MAX_UNUSED_MAX_BYTES};
use crate::entry::{CacheEntry, FileHandle};
use crate::error::{Error, Result};
use crate::manifest;
use crate::stats::CacheStats;
use crate::traits::{CacheObserver, NoopObserver};

/// Key-to-entry index plus the totals over every live entry.
#[derive(Default)]
struct Index {
    map: HashMap<String, Weak<CacheEntry>>,
    total_files: usize,
    total_size: u64,
}

/// Evictable entries ordered by insertion sequence, oldest first. This map
/// holds the canonical strong reference for every unused entry.
#[derive(Default)]
struct UnusedPool {
    entries: BTreeMap<u64, Arc<CacheEntry>>,
    last_seq: u64,
    files: usize,
    size: u64,
}

pub(crate) struct CacheInner {
    dir: PathBuf,
    ext: String,
    index: Mutex<Index>,
    unused: Mutex<UnusedPool>,
    unused_max: AtomicU64,
    offline_max: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    cleared: AtomicBool,
    observer: Box<dyn CacheObserver>,
}

/// Persistent on-disk blob cache.
///
/// Thread-safe: `write`, `get`, and handle drops may run concurrently from
/// any thread. Two mutexes guard the index and the unused pool; whenever
/// both are held the index lock is taken first, and the eviction path never
/// holds both at once.
pub struct FileCache {
    inner: Arc<CacheInner>,
}

impl FileCache {
    /// Open a cache under `config.dirname`, resolved to an absolute path by
    /// `resolve_root`.
    ///
    /// If the directory does not exist it is created and the cache starts
    /// empty. If it exists, the retention manifest is read and every child
    /// not named by it is removed; surviving files are indexed into the
    /// unused pool in manifest order, so the previous run's LRU order
    /// carries over.
    pub fn new(
        config: CacheConfig,
        resolve_root: impl FnOnce(&str) -> PathBuf,
    ) -> Result<Self> {
        Self::with_observer(config, resolve_root, Box::new(NoopObserver))
    }

    /// Open a cache with an observer receiving dirty and eviction callbacks.
    pub fn with_observer(
        config: CacheConfig,
        resolve_root: impl FnOnce(&str) -> PathBuf,
        observer: Box<dyn CacheObserver>,
    ) -> Result<Self> {
        config.validate().map_err(Error::InvalidConfiguration)?;

        let dir = resolve_root(&config.dirname);
        let survivors = bootstrap_dir(&dir, &config.ext)?;

        let inner = Arc::new(CacheInner {
            dir,
            ext: config.ext,
            index: Mutex::new(Index::default()),
            unused: Mutex::new(UnusedPool::default()),
            unused_max: AtomicU64::new(config.unused_max_bytes.min(MAX_UNUSED_MAX_BYTES)),
            offline_max: AtomicU64::new(config.offline_max_bytes.min(MAX_UNUSED_MAX_BYTES)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cleared: AtomicBool::new(false),
            observer,
        });
        CacheInner::adopt_survivors(&inner, survivors);
        Ok(Self { inner })
    }

    /// Store `data` under `key` and return a handle to the new entry.
    ///
    /// If a live entry already exists for `key` the write is refused with a
    /// warning and the existing entry is returned untouched. An I/O failure
    /// leaves no entry and no state change.
    pub fn write(&self, key: &str, data: &[u8]) -> Result<FileHandle> {
        CacheInner::write(&self.inner, key, data, None)
    }

    /// Store `data` under `key` with an opaque payload retrievable through
    /// [`CacheEntry::extra`].
    pub fn write_with_extra(
        &self,
        key: &str,
        data: &[u8],
        extra: Box<dyn Any + Send + Sync>,
    ) -> Result<FileHandle> {
        CacheInner::write(&self.inner, key, data, Some(extra))
    }

    /// Look up a live entry, lifting it out of the unused pool.
    pub fn get(&self, key: &str) -> Option<FileHandle> {
        self.inner.get(key)
    }

    /// Set the unused-pool byte ceiling, clamped to
    /// [`MAX_UNUSED_MAX_BYTES`], and evict immediately to honor it.
    pub fn set_unused_max(&self, bytes: u64) {
        self.inner.set_unused_max(bytes);
    }

    /// Set the restart-persistence byte ceiling, clamped to
    /// [`MAX_UNUSED_MAX_BYTES`]. Takes effect at [`clear`](Self::clear).
    pub fn set_offline_max(&self, bytes: u64) {
        self.inner.set_offline_max(bytes);
    }

    /// Shut the cache down: write the retention manifest, flag the retained
    /// entries to keep their files, and detach everything else so it is
    /// unlinked as its last references drop.
    ///
    /// Runs once; later calls (including the one from `Drop`) are no-ops.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Snapshot the cache counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    /// Absolute path of the cache directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("dir", &self.inner.dir)
            .field("ext", &self.inner.ext)
            .finish_non_exhaustive()
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        self.inner.clear();
    }
}

impl CacheInner {
    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{}", self.ext))
    }

    fn write(
        this: &Arc<Self>,
        key: &str,
        data: &[u8],
        extra: Option<Box<dyn Any + Send + Sync>>,
    ) -> Result<FileHandle> {
        validate_key(key)?;
        let path = this.entry_path(key);

        let mut index = this.index.lock();

        if let Some((existing, promoted)) = this.lookup_locked(&mut index, key) {
            warn!("Attempted to overwrite {key}");
            drop(index);
            if promoted {
                this.observer.dirty();
            }
            return Ok(existing);
        }

        if let Err(e) = write_blob(&path, data) {
            warn!("Failed to write {key} ({e})");
            return Err(e.into());
        }
        debug!("Wrote {key} ({} bytes)", data.len());

        let entry = Arc::new(CacheEntry::new(
            key.to_owned(),
            path,
            data.len() as u64,
            extra,
            Arc::downgrade(this),
        ));
        entry.handles.fetch_add(1, Ordering::AcqRel);
        index.map.insert(key.to_owned(), Arc::downgrade(&entry));
        index.total_files += 1;
        index.total_size += entry.length();
        let handle = FileHandle::from_counted(entry);
        drop(index);

        this.observer.dirty();
        Ok(handle)
    }

    fn get(&self, key: &str) -> Option<FileHandle> {
        let mut index = self.index.lock();
        let found = self.lookup_locked(&mut index, key);
        drop(index);

        match found {
            Some((handle, promoted)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Found {key}");
                if promoted {
                    self.observer.dirty();
                }
                Some(handle)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Resolve a live entry under the index lock, promoting it to in-use.
    /// Returns the handle and whether the entry was unused before the call.
    fn lookup_locked(&self, index: &mut Index, key: &str) -> Option<(FileHandle, bool)> {
        let weak = index.map.get(key)?;
        let Some(entry) = weak.upgrade() else {
            index.map.remove(key);
            return None;
        };

        let prev = entry.handles.fetch_add(1, Ordering::AcqRel);
        if prev == 0 && entry.pooled.swap(false, Ordering::AcqRel) {
            self.remove_unused(&entry);
        }
        // prev == 0 with pooled already false means a release is in flight;
        // it will observe the raised handle count and back off.
        Some((FileHandle::from_counted(entry), prev == 0))
    }

    /// Return the entry to the unused pool. Invoked by the last handle drop
    /// through the entry's back-reference.
    pub(crate) fn release(&self, entry: Arc<CacheEntry>) {
        {
            let mut index = self.index.lock();
            if entry.handles.load(Ordering::Acquire) > 0
                || entry.pooled.load(Ordering::Acquire)
                || entry.back.lock().is_none()
            {
                return;
            }
            // The weak slot may have been stripped by a stale-entry sweep.
            index.map.insert(entry.key().to_owned(), Arc::downgrade(&entry));

            let mut unused = self.unused.lock();
            unused.last_seq += 1;
            let seq = unused.last_seq;
            entry.lru_seq.store(seq, Ordering::Release);
            entry.pooled.store(true, Ordering::Release);
            unused.files += 1;
            unused.size += entry.length();
            unused.entries.insert(seq, entry);
        }
        self.reserve(0);
        self.observer.dirty();
    }

    /// Drop the entry's pool slot. The caller has already cleared the
    /// pooled flag under the index lock.
    fn remove_unused(&self, entry: &CacheEntry) {
        let seq = entry.lru_seq.load(Ordering::Acquire);
        let mut unused = self.unused.lock();
        if unused.entries.remove(&seq).is_some() {
            unused.files -= 1;
            unused.size -= entry.length();
        }
    }

    /// Evict from the oldest end of the pool until `incoming` more bytes
    /// would fit under the ceiling.
    ///
    /// Never holds both mutexes at once: the candidate is peeked under the
    /// unused lock, detached under the index lock (re-checking that a
    /// concurrent `get` did not grab it in between), then its pool slot is
    /// dropped under the unused lock again.
    fn reserve(&self, incoming: u64) {
        let unused_max = self.unused_max.load(Ordering::Acquire);
        let mut evicted_any = false;

        loop {
            let (seq, entry) = {
                let unused = self.unused.lock();
                if unused.size + incoming <= unused_max {
                    break;
                }
                match unused.entries.first_key_value() {
                    Some((&seq, entry)) => (seq, Arc::clone(entry)),
                    None => break,
                }
            };

            {
                let mut index = self.index.lock();
                if entry.handles.load(Ordering::Acquire) > 0
                    || entry.lru_seq.load(Ordering::Acquire) != seq
                    || !entry.pooled.swap(false, Ordering::AcqRel)
                {
                    // Grabbed or re-pooled since the peek; pick a new victim.
                    continue;
                }
                *entry.back.lock() = None;
                index.map.remove(entry.key());
                index.total_files -= 1;
                index.total_size -= entry.length();
            }

            {
                let mut unused = self.unused.lock();
                if unused.entries.remove(&seq).is_some() {
                    unused.files -= 1;
                    unused.size -= entry.length();
                }
            }

            evicted_any = true;
            self.observer.evicted(&entry);
            // The entry drops here; with index and pool references gone its
            // destructor unlinks the file.
        }

        if evicted_any {
            self.observer.dirty();
        }
    }

    fn set_unused_max(&self, bytes: u64) {
        self.unused_max
            .store(bytes.min(MAX_UNUSED_MAX_BYTES), Ordering::Release);
        self.reserve(0);
        self.observer.dirty();
    }

    fn set_offline_max(&self, bytes: u64) {
        self.offline_max
            .store(bytes.min(MAX_UNUSED_MAX_BYTES), Ordering::Release);
    }

    fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        let unused = self.unused.lock();
        CacheStats {
            total_files: index.total_files,
            total_size: index.total_size,
            unused_files: unused.files,
            unused_size: unused.size,
            unused_max: self.unused_max.load(Ordering::Acquire),
            offline_max: self.offline_max.load(Ordering::Acquire),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Index surviving manifest files into the unused pool, oldest first.
    fn adopt_survivors(this: &Arc<Self>, survivors: Vec<(String, u64)>) {
        if survivors.is_empty() {
            return;
        }
        {
            let mut index = this.index.lock();
            let mut unused = this.unused.lock();
            for (key, length) in survivors {
                let path = this.entry_path(&key);
                let entry = Arc::new(CacheEntry::new(
                    key.clone(),
                    path,
                    length,
                    None,
                    Arc::downgrade(this),
                ));
                unused.last_seq += 1;
                let seq = unused.last_seq;
                entry.lru_seq.store(seq, Ordering::Release);
                entry.pooled.store(true, Ordering::Release);
                index.map.insert(key, Arc::downgrade(&entry));
                index.total_files += 1;
                index.total_size += length;
                unused.files += 1;
                unused.size += length;
                unused.entries.insert(seq, entry);
            }
        }
        this.reserve(0);
    }

    pub(crate) fn clear(&self) {
        if self.cleared.swap(true, Ordering::AcqRel) {
            return;
        }

        // Detach every pooled entry and pick the retained set: walk the pool
        // oldest first with a running total of what is still on disk, and
        // evict from the front until the remainder fits the offline ceiling.
        let offline_max = self.offline_max.load(Ordering::Acquire);
        let mut retained = Vec::new();
        {
            let unused = self.unused.lock();
            let mut remaining = unused.size;
            for entry in unused.entries.values() {
                *entry.back.lock() = None;
                if remaining > offline_max {
                    remaining -= entry.length();
                } else {
                    entry.persist.store(true, Ordering::Release);
                    retained.push(entry.key().to_owned());
                    debug!("Persisting {}", entry.key());
                }
            }
        }

        // A manifest that cannot be written retains nothing: stale files on
        // disk would otherwise survive the next bootstrap unlisted.
        if let Err(e) = manifest::write_keys(&self.dir.join(MANIFEST_NAME), &retained) {
            warn!("Failed to write manifest ({e})");
            let unused = self.unused.lock();
            for entry in unused.entries.values() {
                entry.persist.store(false, Ordering::Release);
            }
        }

        // Detach in-use entries still reachable through the index; their
        // files are unlinked when the callers' handles drop.
        {
            let mut index = self.index.lock();
            for weak in index.map.values() {
                if let Some(entry) = weak.upgrade() {
                    *entry.back.lock() = None;
                }
            }
            index.map.clear();
            index.total_files = 0;
            index.total_size = 0;
        }

        // Drain the pool and drop the entries outside the lock; destructors
        // unlink whatever was not flagged to persist.
        let drained: Vec<Arc<CacheEntry>> = {
            let mut unused = self.unused.lock();
            unused.files = 0;
            unused.size = 0;
            std::mem::take(&mut unused.entries).into_values().collect()
        };
        for entry in &drained {
            entry.pooled.store(false, Ordering::Release);
        }
        drop(drained);
    }
}

/// Reject keys that cannot serve as a filename stem or a manifest token.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.contains(['/', '\\', '.'])
        || key.chars().any(char::is_whitespace)
    {
        return Err(Error::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// Write `data` through a sibling temp file and a rename, so a failure
/// mid-write never leaves a truncated blob under the final name.
fn write_blob(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.flush()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Prepare the cache directory: create it when new, otherwise sweep out
/// every child the manifest does not name. Returns the surviving keys and
/// file lengths in manifest order.
fn bootstrap_dir(dir: &Path, ext: &str) -> Result<Vec<(String, u64)>> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("Created {}", dir.display());
        return Ok(Vec::new());
    }

    let retained = match manifest::read_keys(&dir.join(MANIFEST_NAME)) {
        Ok(keys) => keys,
        Err(e) => {
            warn!("Missing manifest in {} ({e})", dir.display());
            Vec::new()
        }
    };
    let retained_set: HashSet<&str> = retained.iter().map(String::as_str).collect();

    let suffix = format!(".{ext}");
    for child in fs::read_dir(dir)? {
        let child = child?;
        let name = child.file_name();
        let keep = name.to_str().is_some_and(|name| {
            name == MANIFEST_NAME
                || name
                    .strip_suffix(&suffix)
                    .is_some_and(|stem| retained_set.contains(stem))
        });
        if !keep {
            match fs::remove_file(child.path()) {
                Ok(()) => debug!("Cleaned {}", child.path().display()),
                Err(e) => debug!("Failed to clean {} ({e})", child.path().display()),
            }
        }
    }

    let mut survivors = Vec::new();
    for key in retained {
        let path = dir.join(format!("{key}{suffix}"));
        if let Ok(meta) = fs::metadata(&path) {
            if meta.is_file() {
                survivors.push((key, meta.len()));
            }
        }
    }
    debug!("Initialized {}", dir.display());
    Ok(survivors)
}
