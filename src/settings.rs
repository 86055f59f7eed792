//! Process settings.
//!
//! Hosts can build [`Settings`] by hand, deserialize it from any serde source, or read the
//! environment variables below with [`Settings::from_env`].
//!
//! | Variable | Default |
//! |---|---|
//! | `RATE_LIMITER_MAX_IP_REQUESTS` | 10 |
//! | `RATE_LIMITER_MAX_TOKEN_REQUESTS` | 100 |
//! | `RATE_LIMITER_WINDOW_SECONDS` | 1 |
//! | `RATE_LIMITER_BLOCK_SECONDS` | 300 |
//! | `RATE_LIMITER_API_KEY_HEADER` | `api_key` |
//! | `RATE_LIMITER_TRUST_FORWARDED` | `false` |
//! | `REDIS_HOST` | `localhost` |
//! | `REDIS_PORT` | 6379 |
//! | `REDIS_PASSWORD` | empty |
//! | `REDIS_DB` | 0 |
//! | `REDIS_KEY_PREFIX` | `rate_limiter:` |

use crate::error::ConfigError;
use crate::limits::Limits;
use crate::rate_limit::classify::DEFAULT_CREDENTIAL_HEADER;
use crate::rate_limit::store::DEFAULT_KEY_PREFIX;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

/// Everything the limiter and its store client need.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub limits: Limits,
    pub redis: RedisSettings,
    /// Header carrying the caller's access credential.
    pub credential_header: String,
    /// Take the client address from `X-Forwarded-For` and friends. Enable only behind a proxy
    /// that overwrites those headers.
    pub trust_forwarded_headers: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            redis: RedisSettings::default(),
            credential_header: DEFAULT_CREDENTIAL_HEADER.to_string(),
            trust_forwarded_headers: false,
        }
    }
}

/// Connection parameters for the shared store.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub key_prefix: String,
}

impl std::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RedisSettings {
    /// `redis://[:password@]host:port/db`, with the password percent-encoded.
    pub fn connection_url(&self) -> String {
        match self.password() {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                encode_userinfo(password),
                self.host,
                self.port,
                self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Structured connection parameters; no URL parsing involved.
    #[cfg(feature = "redis")]
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                password: self.password().map(str::to_string),
                ..Default::default()
            },
        }
    }

    fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for unset or empty variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();
        let limits = defaults.limits;

        let by_address = limits.max_requests_by_address();
        let by_credential = limits.max_requests_by_credential();
        let window_secs = limits.window().as_secs();
        let block_secs = limits.block().as_secs();
        let limits = Limits::new(
            parse_or(&get, "RATE_LIMITER_MAX_IP_REQUESTS", by_address, "request count")?,
            parse_or(&get, "RATE_LIMITER_MAX_TOKEN_REQUESTS", by_credential, "request count")?,
            Duration::from_secs(parse_or(&get, "RATE_LIMITER_WINDOW_SECONDS", window_secs, "number of seconds")?),
            Duration::from_secs(parse_or(&get, "RATE_LIMITER_BLOCK_SECONDS", block_secs, "number of seconds")?),
        )?;

        let credential_header =
            get("RATE_LIMITER_API_KEY_HEADER").unwrap_or(defaults.credential_header);
        if http::HeaderName::from_bytes(credential_header.as_bytes()).is_err() {
            return Err(ConfigError::InvalidHeaderName(credential_header));
        }

        let redis = RedisSettings {
            host: get("REDIS_HOST").unwrap_or(defaults.redis.host),
            port: parse_or(&get, "REDIS_PORT", defaults.redis.port, "port number")?,
            password: get("REDIS_PASSWORD"),
            db: parse_or(&get, "REDIS_DB", defaults.redis.db, "database index")?,
            key_prefix: get("REDIS_KEY_PREFIX").unwrap_or(defaults.redis.key_prefix),
        };

        Ok(Settings {
            limits,
            redis,
            credential_header,
            trust_forwarded_headers: parse_or(&get, "RATE_LIMITER_TRUST_FORWARDED", false, "boolean")?,
        })
    }
}

fn parse_or<T, G>(get: &G, var: &str, default: T, expected: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Unparsable {
            var: var.to_string(),
            value,
            expected,
        }),
    }
}
