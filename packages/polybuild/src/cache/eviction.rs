//! Hybrid eviction policy for the target/action caches.
//!
//! Evaluated in order until the cache is within limits: drop entries older
//! than `max_age`, then LRU down to `max_entries`, then LRU down to
//! `max_size`. Eviction never blocks readers outside of the pass itself; the
//! caller runs it during `flush()` or when a size watermark is crossed.

use bon::Builder;

#[derive(Copy, Clone, Debug, Builder)]
#[non_exhaustive]
pub struct EvictionPolicy {
    #[builder(default = 30 * 24 * 60 * 60)]
    pub max_age_secs: i64,
    #[builder(default = 10_000)]
    pub max_entries: usize,
    #[builder(default = 1024 * 1024 * 1024)]
    pub max_size: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}
