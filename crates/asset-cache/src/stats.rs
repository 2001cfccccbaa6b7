//! Point-in-time cache statistics

/// Snapshot of cache counters.
///
/// Produced by [`FileCache::stats`](crate::FileCache::stats). The totals
/// cover every live entry (in use plus unused); the unused figures cover the
/// evictable pool only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Number of live entries (in use plus unused).
    pub total_files: usize,
    /// Total byte size of live entries.
    pub total_size: u64,
    /// Number of entries in the unused pool.
    pub unused_files: usize,
    /// Total byte size of the unused pool.
    pub unused_size: u64,
    /// Current ceiling for the unused pool.
    pub unused_max: u64,
    /// Current ceiling for the subset retained across restarts.
    pub offline_max: u64,
    /// `get` calls that returned a handle.
    pub hits: u64,
    /// `get` calls that missed.
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate over all `get` calls so far (0.0 when none were made).
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
