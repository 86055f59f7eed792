//! Validated quota configuration.

use crate::error::ConfigError;
use crate::rate_limit::KeyKind;
use serde::Deserialize;
use std::time::Duration;

/// Request ceilings and timing for the fixed-window limiter.
///
/// Immutable once built; every value is guaranteed to be non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawLimits")]
pub struct Limits {
    max_requests_by_address: u64,
    max_requests_by_credential: u64,
    window: Duration,
    block: Duration,
}

/// Serde shape for [`Limits`]; durations are whole seconds.
#[derive(Debug, Deserialize)]
struct RawLimits {
    max_requests_by_address: u64,
    max_requests_by_credential: u64,
    window_secs: u64,
    block_secs: u64,
}

impl TryFrom<RawLimits> for Limits {
    type Error = ConfigError;

    fn try_from(raw: RawLimits) -> Result<Self, Self::Error> {
        Limits::new(
            raw.max_requests_by_address,
            raw.max_requests_by_credential,
            Duration::from_secs(raw.window_secs),
            Duration::from_secs(raw.block_secs),
        )
    }
}

impl Limits {
    /// Create limits with validation.
    ///
    /// # Examples
    /// ```
    /// use bouncer::Limits;
    /// use std::time::Duration;
    /// let limits =
    ///     Limits::new(5, 10, Duration::from_secs(60), Duration::from_secs(300)).unwrap();
    /// assert_eq!(limits.window(), Duration::from_secs(60));
    /// ```
    pub fn new(
        max_requests_by_address: u64,
        max_requests_by_credential: u64,
        window: Duration,
        block: Duration,
    ) -> Result<Self, ConfigError> {
        if max_requests_by_address == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "max_requests_by_address",
                provided: max_requests_by_address,
            });
        }
        if max_requests_by_credential == 0 {
            return Err(ConfigError::InvalidLimit {
                field: "max_requests_by_credential",
                provided: max_requests_by_credential,
            });
        }
        if window.is_zero() {
            return Err(ConfigError::InvalidDuration { field: "window", provided: window });
        }
        if block.is_zero() {
            return Err(ConfigError::InvalidDuration { field: "block", provided: block });
        }
        Ok(Self { max_requests_by_address, max_requests_by_credential, window, block })
    }

    /// Ceiling for callers identified by network address.
    pub fn max_requests_by_address(&self) -> u64 {
        self.max_requests_by_address
    }

    /// Ceiling for callers presenting a credential.
    pub fn max_requests_by_credential(&self) -> u64 {
        self.max_requests_by_credential
    }

    /// Length of a counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// How long a caller stays blocked after exceeding its ceiling.
    pub fn block(&self) -> Duration {
        self.block
    }

    /// The ceiling that applies to a key classification.
    pub fn limit_for(&self, kind: KeyKind) -> u64 {
        match kind {
            KeyKind::Credential => self.max_requests_by_credential,
            KeyKind::Address => self.max_requests_by_address,
        }
    }
}

impl Default for Limits {
    /// 10 requests per address, 100 per credential, one-second window, five-minute block.
    fn default() -> Self {
        Self {
            max_requests_by_address: 10,
            max_requests_by_credential: 100,
            window: Duration::from_secs(1),
            block: Duration::from_secs(300),
        }
    }
}
