#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Bouncer
//!
//! Cluster-wide request rate limiting for HTTP services built on `tower`.
//!
//! ## Features
//!
//! - **Fixed-window quotas** per caller, with separate ceilings for callers identified by
//!   network address and callers presenting an access credential
//! - **Block penalty**: crossing the ceiling refuses the caller for a configurable duration
//! - **Shared state** in Redis so every instance behind a load balancer enforces one quota, or
//!   in process memory for single-instance deployments
//! - **Tower middleware** answering `429` with `X-RateLimit-*` and `Retry-After` headers
//! - **Telemetry sinks** as plain `tower::Service`s
//!
//! ## Quick Start
//!
//! ```rust
//! use bouncer::{FixedWindowLimiter, InMemoryCounterStore, Limits, RateLimitLayer};
//! use http::{Request, Response};
//! use std::convert::Infallible;
//! use tower::{ServiceBuilder, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = FixedWindowLimiter::new(InMemoryCounterStore::new(), Limits::default());
//!     let service = ServiceBuilder::new()
//!         .layer(RateLimitLayer::new(limiter))
//!         .service_fn(|_req: Request<String>| async {
//!             Ok::<_, Infallible>(Response::new(String::from("hello")))
//!         });
//!
//!     let response = service.oneshot(Request::new(String::new())).await.unwrap();
//!     assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
//! }
//! ```

pub mod clock;
pub mod error;
pub mod limits;
pub mod prelude;
pub mod rate_limit;
pub mod settings;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, StoreError};
pub use limits::Limits;
pub use rate_limit::store::{CounterStore, InMemoryCounterStore, KeySpace};
#[cfg(feature = "redis")]
pub use rate_limit::store::{RedisCounterStore, RedisStoreConfig};
pub use rate_limit::strategies::FixedWindowLimiter;
pub use rate_limit::{
    CallerKey, Decision, KeyExtractor, KeyKind, RateLimitLayer, RateLimitService, RateLimiter,
};
pub use settings::{RedisSettings, Settings};
