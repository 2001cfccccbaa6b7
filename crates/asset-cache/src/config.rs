//! Cache configuration
//!
//! [`CacheConfig`] carries the knobs a [`FileCache`](crate::FileCache) is
//! opened with: the directory name handed to the storage-root resolver, the
//! filename extension applied to every blob, and the two independent byte
//! ceilings (resident unused pool, and the subset persisted across restarts).

/// Default ceiling for the unused (evictable) pool, in bytes.
pub const DEFAULT_UNUSED_MAX_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Upper clamp applied to both ceilings whenever they are set.
pub const MAX_UNUSED_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Name of the retention manifest written into the cache directory at shutdown.
pub const MANIFEST_NAME: &str = "manifest";

/// Configuration for a [`FileCache`](crate::FileCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory name, resolved to an absolute path through the injected
    /// storage-root resolver.
    pub dirname: String,
    /// Filename extension (no leading dot) applied as `<dir>/<key>.<ext>`.
    pub ext: String,
    /// Byte ceiling for the unused pool. Clamped to [`MAX_UNUSED_MAX_BYTES`].
    pub unused_max_bytes: u64,
    /// Byte ceiling for the subset retained across restarts. Clamped to
    /// [`MAX_UNUSED_MAX_BYTES`].
    pub offline_max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dirname: "cache".to_owned(),
            ext: "blob".to_owned(),
            unused_max_bytes: DEFAULT_UNUSED_MAX_BYTES,
            offline_max_bytes: DEFAULT_UNUSED_MAX_BYTES,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default ceilings.
    pub fn new(dirname: impl Into<String>, ext: impl Into<String>) -> Self {
        Self {
            dirname: dirname.into(),
            ext: ext.into(),
            ..Self::default()
        }
    }

    /// Set the unused-pool byte ceiling.
    pub fn with_unused_max(mut self, bytes: u64) -> Self {
        self.unused_max_bytes = bytes;
        self
    }

    /// Set the restart-persistence byte ceiling.
    pub fn with_offline_max(mut self, bytes: u64) -> Self {
        self.offline_max_bytes = bytes;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.dirname.is_empty() {
            return Err("dirname must not be empty".to_owned());
        }

        if self.ext.is_empty() {
            return Err("ext must not be empty".to_owned());
        }

        if self.ext.contains(['.', '/', '\\']) || self.ext.chars().any(char::is_whitespace) {
            return Err("ext must be a bare extension without dot or separators".to_owned());
        }

        Ok(())
    }
}
