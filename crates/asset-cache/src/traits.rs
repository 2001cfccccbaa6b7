//! Observer hooks for cache state changes

use crate::entry::CacheEntry;

/// Callbacks fired by [`FileCache`](crate::FileCache).
///
/// `dirty` is a coalescable hint that observable state changed; closely
/// spaced changes may surface as a single notification and no transactional
/// meaning should be read into it. Callbacks are invoked with no cache lock
/// held, so an observer may call back into the cache.
pub trait CacheObserver: Send + Sync {
    /// Observable state changed: a write landed, an entry moved between the
    /// in-use and unused pools, an eviction ran, or a ceiling was lowered.
    fn dirty(&self) {}

    /// An entry was evicted to enforce the unused-pool ceiling. Fired after
    /// the entry left the index and the pool, while its backing file still
    /// exists.
    fn evicted(&self, entry: &CacheEntry) {
        let _ = entry;
    }
}

/// Observer that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl CacheObserver for NoopObserver {}
