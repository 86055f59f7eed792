//! In-process counter store.
//!
//! Keeps the same three-operation contract as the shared stores, with per-key expiry deadlines
//! read from a [`Clock`]. Only suitable when a single process serves all traffic: nothing is
//! shared across instances.

use super::{ttl_millis, CounterStore, KeySpace};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// `tokio::time::interval` panics on a zero period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    /// Epoch millis after which the entry is gone; `None` never expires.
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: u64) -> Duration {
        self.expires_at.map_or(Duration::ZERO, |at| Duration::from_millis(at.saturating_sub(now)))
    }
}

/// Simple in-memory counter store.
///
/// Clones share the same entries.
#[derive(Clone, Debug)]
pub struct InMemoryCounterStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            keys: KeySpace::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the key namespace.
    pub fn with_key_space(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    /// Number of live entries (counters and block markers).
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    /// Returns true if no live entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, e| !e.is_expired(now));
        before - guard.len()
    }

    /// Purge expired entries every `every` (at least one millisecond) on the current tokio runtime.
    ///
    /// Expired entries are already ignored on access; sweeping only bounds memory for callers
    /// that never come back. Abort the handle to stop.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let every = every.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = store.purge_expired();
                if removed > 0 {
                    tracing::debug!(removed, "in-memory counter store: purged expired entries");
                }
            }
        })
    }

    // A panic while holding the lock cannot leave an entry half-written, so a poisoned map is
    // still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_expired(map: &mut HashMap<String, Entry>, key: &str, now: u64) {
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    type Error = Infallible;

    async fn is_blocked(&self, key: &str) -> Result<(bool, Duration), Self::Error> {
        let block_key = self.keys.block(key);
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        Self::evict_expired(&mut guard, &block_key, now);
        Ok(match guard.get(&block_key) {
            Some(entry) => (true, entry.remaining(now)),
            None => (false, Duration::ZERO),
        })
    }

    async fn incr_request(&self, key: &str, window: Duration) -> Result<(u64, Duration), Self::Error> {
        let counter_key = self.keys.counter(key);
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        Self::evict_expired(&mut guard, &counter_key, now);
        let entry = guard.entry(counter_key).or_insert(Entry { value: 0, expires_at: None });
        entry.value = entry.value.saturating_add(1);
        if entry.value == 1 {
            entry.expires_at = Some(now.saturating_add(ttl_millis(window)));
        }
        Ok((entry.value, entry.remaining(now)))
    }

    async fn block_request(&self, key: &str, duration: Duration) -> Result<(), Self::Error> {
        let block_key = self.keys.block(key);
        let now = self.clock.now_millis();
        self.lock()
            .insert(block_key, Entry { value: 1, expires_at: Some(now.saturating_add(ttl_millis(duration))) });
        Ok(())
    }
}
