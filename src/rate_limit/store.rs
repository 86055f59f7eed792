use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::InMemoryCounterStore;
#[cfg(feature = "redis")]
pub use redis_store::{RedisCounterStore, RedisStoreConfig};

/// Default namespace shared by every key this crate writes.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limiter:";

/// Abstract storage interface for window counters and block markers.
///
/// Implementations must make `incr_request` atomic per key: it is the only synchronization the
/// limiter relies on, across tasks and across processes sharing the store. None of the
/// operations retry; failures surface unchanged.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether `key` is serving a block, and for how much longer.
    ///
    /// An absent marker is not an error: it reports `(false, Duration::ZERO)`.
    async fn is_blocked(&self, key: &str) -> Result<(bool, Duration), Self::Error>;

    /// Atomically count one request for `key` and return `(count, time left in window)`.
    ///
    /// The increment that creates the counter (count == 1) starts the window by setting its TTL
    /// to `window`; later increments leave the TTL alone.
    async fn incr_request(&self, key: &str, window: Duration) -> Result<(u64, Duration), Self::Error>;

    /// Place (or replace) the block marker for `key` with a TTL of `duration`.
    async fn block_request(&self, key: &str, duration: Duration) -> Result<(), Self::Error>;
}

#[async_trait]
impl<S> CounterStore for std::sync::Arc<S>
where
    S: CounterStore + ?Sized,
{
    type Error = S::Error;

    async fn is_blocked(&self, key: &str) -> Result<(bool, Duration), Self::Error> {
        (**self).is_blocked(key).await
    }

    async fn incr_request(&self, key: &str, window: Duration) -> Result<(u64, Duration), Self::Error> {
        (**self).incr_request(key, window).await
    }

    async fn block_request(&self, key: &str, duration: Duration) -> Result<(), Self::Error> {
        (**self).block_request(key, duration).await
    }
}

/// Maps caller values onto disjoint counter and block key spaces.
///
/// The key classification is deliberately not part of the store key: an address and a
/// credential with the same literal value share records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space rooted at `prefix` (e.g. `"rate_limiter:"`).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Store key of the window counter for `value`.
    pub fn counter(&self, value: &str) -> String {
        format!("{}req:{}", self.prefix, value)
    }

    /// Store key of the block marker for `value`.
    pub fn block(&self, value: &str) -> String {
        format!("{}block:{}", self.prefix, value)
    }

    /// Shared prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

/// Longest TTL handed to a store. Redis adds the current time to `PX`/`PEXPIRE` values and
/// rejects sums outside `i64`, so half of that range is left as headroom.
pub(crate) const MAX_TTL_MILLIS: u64 = i64::MAX as u64 / 2;

/// Whole milliseconds of `duration`, at least one so a positive TTL never rounds to "no expiry",
/// and at most [`MAX_TTL_MILLIS`].
pub(crate) fn ttl_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).clamp(1, MAX_TTL_MILLIS)
}
