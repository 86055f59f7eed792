//! Rate limiting primitives.
//!
//! This module provides the building blocks for cluster-wide admission control:
//! - [`RateLimiter`]: The seam between HTTP glue and the decision logic.
//! - [`FixedWindowLimiter`](strategies::FixedWindowLimiter): The decision engine.
//! - [`CounterStore`](store::CounterStore): The three store operations the engine needs.
//! - [`RateLimitLayer`]: Tower middleware that enforces the limit on `http` requests.
//! - [`Decision`]: The result of a rate limit check.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` classifies the request into a [`CallerKey`] and asks a
//!   `RateLimiter`. It doesn't know *how* limiting works, only how to render the answer.
//! - **Logic**: `FixedWindowLimiter` checks the block marker, increments the window counter and
//!   places a block when the ceiling is crossed. It holds no mutable state.
//! - **Storage**: `CounterStore` implementations own every counter and marker, so all instances
//!   sharing a store enforce the same quota. Redis is the production backend
//!   (`store::redis_store`, feature `redis`); `InMemoryCounterStore` serves single-process setups.

use std::fmt;
use std::time::{Duration, SystemTime};

pub mod classify;
pub mod middleware;
pub mod store;
pub mod strategies;

pub use classify::KeyExtractor;
pub use middleware::{RateLimitLayer, RateLimitService};

/// How a caller was identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Identified by network address (no credential presented).
    Address,
    /// Identified by the opaque access credential.
    Credential,
}

impl KeyKind {
    /// Label used in logs and telemetry.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Address => "address",
            KeyKind::Credential => "credential",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity a quota is tracked against.
///
/// `Display` and `Debug` never print a credential value, so keys can go straight into logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CallerKey {
    value: String,
    kind: KeyKind,
}

impl CallerKey {
    /// Key for a caller identified by address.
    pub fn address(value: impl Into<String>) -> Self {
        Self { value: value.into(), kind: KeyKind::Address }
    }

    /// Key for a caller presenting a credential.
    pub fn credential(value: impl Into<String>) -> Self {
        Self { value: value.into(), kind: KeyKind::Credential }
    }

    /// Raw value used to derive store keys.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Classification selecting the applicable ceiling.
    pub fn kind(&self) -> KeyKind {
        self.kind
    }
}

impl fmt::Display for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            KeyKind::Address => write!(f, "address:{}", self.value),
            KeyKind::Credential => f.write_str("credential:<redacted>"),
        }
    }
}

impl fmt::Debug for CallerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallerKey({})", self)
    }
}

/// The decision returned by a rate limiter.
///
/// Denied decisions always report zero remaining requests; allowed decisions never carry a
/// retry instant. The constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_at: Option<SystemTime>,
    retry_at: Option<SystemTime>,
}

impl Decision {
    /// Request admitted; `remaining` requests are left until `reset_at`.
    pub fn allowed(limit: u64, remaining: u64, reset_at: SystemTime) -> Self {
        Self { allowed: true, limit, remaining, reset_at: Some(reset_at), retry_at: None }
    }

    /// Request pushed the window counter past the ceiling.
    pub fn over_limit(limit: u64, reset_at: SystemTime, retry_at: SystemTime) -> Self {
        Self { allowed: false, limit, remaining: 0, reset_at: Some(reset_at), retry_at: Some(retry_at) }
    }

    /// Caller is serving a block; nothing was counted.
    pub fn blocked(limit: u64, retry_at: SystemTime) -> Self {
        Self { allowed: false, limit, remaining: 0, reset_at: None, retry_at: Some(retry_at) }
    }

    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Ceiling that applied to the caller.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Requests left in the current window. Useful for `X-RateLimit-Remaining` headers.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// When the current counting window ends, if a window was consulted.
    pub fn reset_at(&self) -> Option<SystemTime> {
        self.reset_at
    }

    /// When a denied caller may try again.
    pub fn retry_at(&self) -> Option<SystemTime> {
        self.retry_at
    }

    /// The instant the caller's situation changes: the retry instant when denied, otherwise the
    /// window reset.
    pub fn next_reset(&self) -> Option<SystemTime> {
        self.retry_at.or(self.reset_at)
    }

    /// How long to wait from `now` until [`next_reset`](Self::next_reset). Zero when unknown or
    /// already past. Useful for `Retry-After` headers.
    pub fn retry_after(&self, now: SystemTime) -> Duration {
        self.next_reset()
            .and_then(|at| at.duration_since(now).ok())
            .unwrap_or(Duration::ZERO)
    }

    /// How long from `now` until the counting window ends. Zero for blocked decisions.
    pub fn reset_after(&self, now: SystemTime) -> Duration {
        self.reset_at.and_then(|at| at.duration_since(now).ok()).unwrap_or(Duration::ZERO)
    }
}

/// Core interface for rate limiting logic.
///
/// This trait decouples the middleware from the engine so alternative engines or test doubles
/// can be mounted. Errors are the backing store's, unchanged.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Error surfaced when the decision could not be made.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide whether `key` may issue one more request.
    async fn allow(&self, key: &CallerKey) -> Result<Decision, Self::Error>;
}

#[async_trait::async_trait]
impl<L> RateLimiter for std::sync::Arc<L>
where
    L: RateLimiter + ?Sized,
{
    type Error = L::Error;

    async fn allow(&self, key: &CallerKey) -> Result<Decision, Self::Error> {
        (**self).allow(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn credential_is_redacted_in_logs() {
        let key = CallerKey::credential("s3cr3t-token");
        assert_eq!(key.to_string(), "credential:<redacted>");
        assert!(!format!("{:?}", key).contains("s3cr3t"));
        assert_eq!(key.value(), "s3cr3t-token");

        let key = CallerKey::address("10.0.0.7");
        assert_eq!(key.to_string(), "address:10.0.0.7");
        assert_eq!(key.kind(), KeyKind::Address);
    }

    #[test]
    fn denied_decisions_have_no_remaining() {
        let at = UNIX_EPOCH + Duration::from_secs(100);
        let blocked = Decision::blocked(5, at);
        assert!(!blocked.is_allowed());
        assert_eq!(blocked.remaining(), 0);
        assert_eq!(blocked.reset_at(), None);

        let over = Decision::over_limit(5, at, at + Duration::from_secs(300));
        assert!(!over.is_allowed());
        assert_eq!(over.remaining(), 0);
        assert_eq!(over.next_reset(), Some(at + Duration::from_secs(300)));

        let ok = Decision::allowed(5, 4, at);
        assert!(ok.is_allowed());
        assert_eq!(ok.retry_at(), None);
        assert_eq!(ok.next_reset(), Some(at));
    }

    #[test]
    fn retry_after_saturates() {
        let now = UNIX_EPOCH + Duration::from_secs(100);
        let d = Decision::blocked(5, now + Duration::from_secs(30));
        assert_eq!(d.retry_after(now), Duration::from_secs(30));
        assert_eq!(d.retry_after(now + Duration::from_secs(60)), Duration::ZERO);
        assert_eq!(d.reset_after(now), Duration::ZERO);

        let over = Decision::over_limit(5, now + Duration::from_secs(20), now + Duration::from_secs(300));
        assert_eq!(over.reset_after(now), Duration::from_secs(20));
        assert_eq!(over.retry_after(now), Duration::from_secs(300));
    }
}
