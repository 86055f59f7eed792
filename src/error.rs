//! Error types for stores and configuration.
//!
//! The decision engine adds no error kind of its own: a failed `allow` is always the store's
//! error, passed through unchanged.
use std::time::Duration;

/// Boxed error used to carry a store client's native error without tying this module to it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure talking to the shared counter store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A store command failed (connectivity, timeout, protocol).
    #[error("store command {command} failed for key {key}")]
    Command {
        /// Store command that failed (e.g. `INCR`).
        command: &'static str,
        /// Fully namespaced store key.
        key: String,
        /// Client error.
        #[source]
        source: BoxError,
    },
    /// The counter was incremented but its window TTL could not be set, so the increment is
    /// orphaned until the next call repairs it.
    #[error("counter {key} reached {count} but its window could not be started")]
    WindowNotStarted {
        /// Fully namespaced counter key.
        key: String,
        /// Post-increment count that was already recorded.
        count: u64,
        /// Client error.
        #[source]
        source: BoxError,
    },
    /// The store answered with something the adapter cannot interpret.
    #[error("unexpected reply to {command} for key {key}: {reply}")]
    UnexpectedReply {
        /// Store command that was issued.
        command: &'static str,
        /// Fully namespaced store key.
        key: String,
        /// Printable form of the reply.
        reply: String,
    },
}

impl StoreError {
    /// Wrap a client error for `command` on `key`.
    pub fn command<E>(command: &'static str, key: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Command { command, key: key.into(), source: Box::new(source) }
    }

    /// The namespaced key the failure relates to.
    pub fn key(&self) -> &str {
        match self {
            StoreError::Command { key, .. }
            | StoreError::WindowNotStarted { key, .. }
            | StoreError::UnexpectedReply { key, .. } => key,
        }
    }

    /// Check if the failure left an increment without a window.
    pub fn is_window_not_started(&self) -> bool {
        matches!(self, StoreError::WindowNotStarted { .. })
    }
}

/// Errors produced when validating limits or reading settings.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A request ceiling must be > 0.
    #[error("{field} must be > 0 (got {provided})")]
    InvalidLimit {
        /// Name of the offending setting.
        field: &'static str,
        /// Value provided by caller.
        provided: u64,
    },
    /// A window or block duration must be > 0.
    #[error("{field} must be > 0 (got {provided:?})")]
    InvalidDuration {
        /// Name of the offending setting.
        field: &'static str,
        /// Value provided by caller.
        provided: Duration,
    },
    /// An environment variable held a value that could not be parsed.
    #[error("{var}={value:?} is not a valid {expected}")]
    Unparsable {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// What the value should have been.
        expected: &'static str,
    },
    /// The credential header name is not a valid HTTP header name.
    #[error("{0:?} is not a valid header name")]
    InvalidHeaderName(String),
}
