//! Convenient re-exports for common Bouncer types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    error::{ConfigError, StoreError},
    limits::Limits,
    rate_limit::{
        store::{CounterStore, InMemoryCounterStore},
        strategies::FixedWindowLimiter,
        CallerKey, Decision, KeyExtractor, KeyKind, RateLimitLayer, RateLimiter,
    },
    settings::Settings,
    telemetry::{LimiterEvent, LogSink, MemorySink, NullSink, TelemetrySink},
};
