//! Redis-backed counter store.
//!
//! Provides the shared backend that lets every instance behind a load balancer enforce the same
//! quota.
//!
//! ## Key layout
//!
//! - `<prefix>req:<caller>`: window counter, created by `INCR`, TTL set with `PEXPIRE` when the
//!   counter is created.
//! - `<prefix>block:<caller>`: block marker, written with `SET .. PX`.
//!
//! Remaining lifetimes are read with `PTTL`, so reset instants have millisecond precision.
//!
//! ## Error Handling
//!
//! Every command failure surfaces as a [`StoreError`]; nothing is retried here. Reconnection
//! and timeouts belong to the `ConnectionManager` configuration.
//!
//! The store is generic over [`ConnectionLike`], defaulting to `ConnectionManager`; any cheaply
//! cloned async connection works.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bouncer::rate_limit::store::{RedisCounterStore, RedisStoreConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = RedisCounterStore::connect_with_config(
//!         "redis://127.0.0.1/",
//!         RedisStoreConfig::default(),
//!     )
//!     .await
//!     .expect("Failed to connect to Redis");
//! }
//! ```

use super::{ttl_millis, CounterStore, KeySpace, DEFAULT_KEY_PREFIX};
use crate::error::StoreError;
use crate::settings::RedisSettings;
use ::redis::aio::{ConnectionLike, ConnectionManager, ConnectionManagerConfig};
use ::redis::{Client, IntoConnectionInfo, RedisError};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// `PTTL` reply for a key that does not exist.
const PTTL_MISSING: i64 = -2;
/// `PTTL` reply for a key that exists without an expiry.
const PTTL_PERSISTENT: i64 = -1;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Key prefix for Redis keys (default: "rate_limiter:")
    pub key_prefix: String,
    /// Give up establishing a connection after this long.
    pub connection_timeout: Option<Duration>,
    /// Give up waiting for a command reply after this long.
    pub response_timeout: Option<Duration>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connection_timeout: None,
            response_timeout: None,
        }
    }
}

/// Redis-backed storage for distributed rate limiting.
///
/// Cloning is cheap: clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisCounterStore<C = ConnectionManager> {
    connection: C,
    keys: KeySpace,
}

impl<C> fmt::Debug for RedisCounterStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("keys", &self.keys)
            .field("connection", &std::any::type_name::<C>())
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with custom configuration.
    ///
    /// `target` is a URL or a [`redis::ConnectionInfo`].
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config<T>(target: T, config: RedisStoreConfig) -> Result<Self, RedisError>
    where
        T: IntoConnectionInfo,
    {
        let client = Client::open(target)?;
        let mut manager_config = ConnectionManagerConfig::new();
        if let Some(timeout) = config.connection_timeout {
            manager_config = manager_config.set_connection_timeout(timeout);
        }
        if let Some(timeout) = config.response_timeout {
            manager_config = manager_config.set_response_timeout(timeout);
        }
        let connection = ConnectionManager::new_with_config(client, manager_config).await?;
        tracing::debug!(prefix = %config.key_prefix, "connected to redis counter store");
        Ok(Self::from_connection(connection, config.key_prefix))
    }

    /// Connect using process settings.
    ///
    /// The password is passed as a structured field, never through a URL.
    ///
    /// # Errors
    /// Returns error if the connection fails.
    pub async fn connect_with_settings(settings: &RedisSettings) -> Result<Self, RedisError> {
        let config = RedisStoreConfig {
            key_prefix: settings.key_prefix.clone(),
            ..RedisStoreConfig::default()
        };
        Self::connect_with_config(settings.connection_info(), config).await
    }
}

impl<C> RedisCounterStore<C> {
    /// Wrap an existing connection.
    pub fn from_connection(connection: C, key_prefix: impl Into<String>) -> Self {
        Self { connection, keys: KeySpace::new(key_prefix) }
    }

    /// Key namespace in use.
    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }
}

impl<C> RedisCounterStore<C>
where
    C: ConnectionLike + Clone + Send,
{
    async fn pttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::command("PTTL", key, e))
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, RedisError> {
        let mut conn = self.connection.clone();
        ::redis::cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).query_async(&mut conn).await
    }
}

/// Interpret the `PTTL` of a block marker.
fn block_state(key: &str, pttl: i64) -> Result<(bool, Duration), StoreError> {
    match pttl {
        PTTL_MISSING | 0 => Ok((false, Duration::ZERO)),
        PTTL_PERSISTENT => Ok((true, Duration::ZERO)),
        ms if ms > 0 => Ok((true, Duration::from_millis(ms.unsigned_abs()))),
        other => Err(StoreError::UnexpectedReply {
            command: "PTTL",
            key: key.to_string(),
            reply: other.to_string(),
        }),
    }
}

/// What the `PTTL` of a freshly incremented counter says about its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowTtl {
    Remaining(Duration),
    /// The counter exists but never got a TTL.
    Persistent,
    /// Expired between `INCR` and `PTTL`.
    Gone,
}

fn window_ttl(pttl: i64) -> WindowTtl {
    match pttl {
        ms if ms > 0 => WindowTtl::Remaining(Duration::from_millis(ms.unsigned_abs())),
        PTTL_PERSISTENT => WindowTtl::Persistent,
        _ => WindowTtl::Gone,
    }
}

fn counter_value(key: &str, raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::UnexpectedReply {
        command: "INCR",
        key: key.to_string(),
        reply: raw.to_string(),
    })
}

#[async_trait]
impl<C> CounterStore for RedisCounterStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    type Error = StoreError;

    async fn is_blocked(&self, key: &str) -> Result<(bool, Duration), Self::Error> {
        let block_key = self.keys.block(key);
        let pttl = self.pttl(&block_key).await?;
        if pttl == PTTL_PERSISTENT {
            tracing::warn!(key = %block_key, "block marker has no expiry");
        }
        block_state(&block_key, pttl)
    }

    async fn incr_request(&self, key: &str, window: Duration) -> Result<(u64, Duration), Self::Error> {
        let counter_key = self.keys.counter(key);
        let mut conn = self.connection.clone();

        let raw: i64 = ::redis::cmd("INCR")
            .arg(&counter_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::command("INCR", counter_key.as_str(), e))?;
        let count = counter_value(&counter_key, raw)?;
        tracing::debug!(key = %counter_key, count, "incremented request counter");

        if count == 1 {
            if let Err(e) = self.pexpire(&counter_key, window).await {
                return Err(StoreError::WindowNotStarted {
                    key: counter_key,
                    count,
                    source: Box::new(e),
                });
            }
        }

        let remaining = match window_ttl(self.pttl(&counter_key).await?) {
            WindowTtl::Remaining(left) => left,
            WindowTtl::Persistent => {
                // An earlier increment created the key but never got its TTL; start the window
                // now instead of counting forever.
                tracing::warn!(key = %counter_key, count, "request counter had no expiry; restarting window");
                self.pexpire(&counter_key, window).await.map_err(|e| StoreError::WindowNotStarted {
                    key: counter_key.clone(),
                    count,
                    source: Box::new(e),
                })?;
                window
            }
            WindowTtl::Gone => Duration::ZERO,
        };
        Ok((count, remaining))
    }

    async fn block_request(&self, key: &str, duration: Duration) -> Result<(), Self::Error> {
        let block_key = self.keys.block(key);
        let mut conn = self.connection.clone();
        let () = ::redis::cmd("SET")
            .arg(&block_key)
            .arg("blocked")
            .arg("PX")
            .arg(ttl_millis(duration))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::command("SET", block_key.as_str(), e))?;
        tracing::debug!(key = %block_key, ?duration, "block marker written");
        Ok(())
    }
}
