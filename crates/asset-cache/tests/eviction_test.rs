//! LRU eviction: ordering, ceilings, observer callbacks.

use asset_cache::{
    CacheConfig, CacheEntry, CacheObserver, FileCache, MAX_UNUSED_MAX_BYTES,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn open(root: &Path, unused_max: u64) -> FileCache {
    FileCache::new(
        CacheConfig::new("store", "bin").with_unused_max(unused_max),
        |name| root.join(name),
    )
    .unwrap()
}

#[test]
fn evicts_oldest_entry_first() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open(tmp.path(), 10);

    for key in ["a", "b", "c"] {
        drop(cache.write(key, &[0u8; 4]).unwrap());
    }

    // Dropping "c" pushed the pool to 12 > 10, so "a" went first.
    let dir = cache.dir();
    assert!(!dir.join("a.bin").exists());
    assert!(dir.join("b.bin").exists());
    assert!(dir.join("c.bin").exists());

    assert!(cache.get("a").is_none());
    let stats = cache.stats();
    assert_eq!(stats.unused_files, 2);
    assert_eq!(stats.unused_size, 8);
    assert_eq!(stats.total_files, 2);
}

#[test]
fn get_refreshes_lru_position() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open(tmp.path(), 8);

    drop(cache.write("a", &[0u8; 4]).unwrap());
    drop(cache.write("b", &[0u8; 4]).unwrap());

    // Touch "a" so "b" becomes the oldest pooled entry.
    drop(cache.get("a").unwrap());

    drop(cache.write("c", &[0u8; 4]).unwrap());
    assert!(cache.get("b").is_none());
    assert!(cache.get("a").is_some());
    assert!(cache.get("c").is_some());
}

#[test]
fn ceiling_holds_after_every_drop() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open(tmp.path(), 64);

    for i in 0..32 {
        let key = format!("k{i}");
        drop(cache.write(&key, &[0u8; 16]).unwrap());
        let stats = cache.stats();
        assert!(stats.unused_size <= stats.unused_max);
        assert!(stats.unused_size <= stats.total_size);
    }
}

#[test]
fn in_use_entries_are_never_evicted() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open(tmp.path(), 4);

    let pinned = cache.write("pinned", &[0u8; 4]).unwrap();
    drop(cache.write("other", &[0u8; 4]).unwrap());

    // "other" alone exceeds nothing, but a second pooled entry would; the
    // pinned entry stays because it never entered the pool.
    assert!(cache.dir().join("pinned.bin").exists());
    assert_eq!(pinned.length(), 4);
    assert_eq!(cache.stats().total_files, 2);
}

#[test]
fn shrinking_the_ceiling_evicts_down_to_it() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open(tmp.path(), 100);

    for key in ["a", "b", "c"] {
        drop(cache.write(key, &[0u8; 4]).unwrap());
    }
    assert_eq!(cache.stats().unused_size, 12);

    cache.set_unused_max(4);
    let stats = cache.stats();
    assert_eq!(stats.unused_size, 4);
    assert_eq!(stats.unused_max, 4);
    assert!(cache.get("a").is_none());
    assert!(cache.get("b").is_none());
    assert!(cache.get("c").is_some());
}

#[test]
fn zero_ceiling_evicts_on_release() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open(tmp.path(), 0);

    let handle = cache.write("a", &[0u8; 4]).unwrap();
    assert!(cache.dir().join("a.bin").exists());

    drop(handle);
    assert!(!cache.dir().join("a.bin").exists());
    let stats = cache.stats();
    assert_eq!(stats.total_files, 0);
    assert_eq!(stats.unused_files, 0);
}

#[test]
fn ceilings_clamp_to_documented_maximum() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open(tmp.path(), 100);

    cache.set_unused_max(u64::MAX);
    cache.set_offline_max(u64::MAX);
    let stats = cache.stats();
    assert_eq!(stats.unused_max, MAX_UNUSED_MAX_BYTES);
    assert_eq!(stats.offline_max, MAX_UNUSED_MAX_BYTES);
}

#[derive(Default)]
struct RecorderState {
    evicted: Mutex<Vec<String>>,
    dirty: AtomicUsize,
}

struct Recorder(Arc<RecorderState>);

impl CacheObserver for Recorder {
    fn dirty(&self) {
        self.0.dirty.fetch_add(1, Ordering::Relaxed);
    }

    fn evicted(&self, entry: &CacheEntry) {
        self.0.evicted.lock().unwrap().push(entry.key().to_owned());
    }
}

#[test]
fn observer_sees_evictions_and_dirty_hints() {
    let tmp = tempfile::tempdir().unwrap();
    let state = Arc::new(RecorderState::default());
    let cache = FileCache::with_observer(
        CacheConfig::new("store", "bin").with_unused_max(10),
        |name| tmp.path().join(name),
        Box::new(Recorder(Arc::clone(&state))),
    )
    .unwrap();

    for key in ["a", "b", "c"] {
        drop(cache.write(key, &[0u8; 4]).unwrap());
    }

    assert_eq!(*state.evicted.lock().unwrap(), vec!["a".to_owned()]);
    // Three writes, three releases, one eviction pass.
    assert!(state.dirty.load(Ordering::Relaxed) >= 7);
}
