//! Telemetry for rate limiting decisions.
//!
//! The engine emits a [`LimiterEvent`] for every decision and for every store anomaly it
//! tolerates or surfaces. Events flow through `TelemetrySink` implementations which can log,
//! aggregate, or forward them to external systems. Events never carry a caller's credential or
//! address, only its [`KeyKind`].
//!
//! ```rust
//! use bouncer::telemetry::{DenyReason, LimiterEvent};
//! use bouncer::KeyKind;
//! use std::time::Duration;
//!
//! let denied = LimiterEvent::Denied {
//!     kind: KeyKind::Address,
//!     limit: 10,
//!     reason: DenyReason::OverLimit,
//!     retry_after: Duration::from_secs(300),
//! };
//! assert!(denied.to_string().contains("OverLimit"));
//! ```

use crate::rate_limit::KeyKind;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower_service::Service;

/// A telemetry sink that consumes limiter events.
///
/// Sinks are plain `tower::Service`s, so they compose with standard tower combinators.
///
/// # Implementing a Custom Sink
///
/// ```rust
/// use bouncer::telemetry::{LimiterEvent, TelemetrySink};
/// use tower::Service;
/// use std::future::Future;
/// use std::pin::Pin;
/// use std::task::{Context, Poll};
///
/// #[derive(Clone)]
/// struct StdoutSink;
///
/// impl Service<LimiterEvent> for StdoutSink {
///     type Response = ();
///     type Error = std::convert::Infallible;
///     type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
///
///     fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
///         Poll::Ready(Ok(()))
///     }
///
///     fn call(&mut self, event: LimiterEvent) -> Self::Future {
///         println!("{event}");
///         Box::pin(async { Ok(()) })
///     }
/// }
///
/// impl TelemetrySink for StdoutSink {
///     type SinkError = std::convert::Infallible;
/// }
/// ```
pub trait TelemetrySink:
    tower::Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The caller was already serving a block; nothing was counted.
    Blocked,
    /// This request pushed the window counter past the ceiling.
    OverLimit,
}

/// Store operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    IsBlocked,
    IncrRequest,
    BlockRequest,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::IsBlocked => "is_blocked",
            StoreOperation::IncrRequest => "incr_request",
            StoreOperation::BlockRequest => "block_request",
        }
    }
}

/// Events emitted by the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimiterEvent {
    /// Request admitted.
    Allowed { kind: KeyKind, limit: u64, remaining: u64 },
    /// Request refused.
    Denied { kind: KeyKind, limit: u64, reason: DenyReason, retry_after: Duration },
    /// A block marker was written.
    BlockPlaced { kind: KeyKind, duration: Duration },
    /// The block marker could not be written; the denial stood regardless.
    BlockNotPersisted { kind: KeyKind, error: String },
    /// No decision could be made.
    StoreFailed { kind: KeyKind, operation: StoreOperation, error: String },
}

impl fmt::Display for LimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterEvent::Allowed { kind, limit, remaining } => {
                write!(f, "Limiter::Allowed({kind}, {remaining}/{limit} left)")
            }
            LimiterEvent::Denied { kind, limit, reason, retry_after } => {
                write!(f, "Limiter::Denied({kind}, {reason:?}, limit={limit}, retry_after={retry_after:?})")
            }
            LimiterEvent::BlockPlaced { kind, duration } => {
                write!(f, "Limiter::BlockPlaced({kind}, {duration:?})")
            }
            LimiterEvent::BlockNotPersisted { kind, error } => {
                write!(f, "Limiter::BlockNotPersisted({kind}, {error})")
            }
            LimiterEvent::StoreFailed { kind, operation, error } => {
                write!(f, "Limiter::StoreFailed({kind}, {}, {error})", operation.as_str())
            }
        }
    }
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Events are logged at INFO level with structured fields.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        tracing::info!(event = %event, "limiter_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Useful for testing and debugging. Oldest events are evicted once `capacity` is reached.
///
/// ```rust
/// use bouncer::telemetry::{LimiterEvent, MemorySink};
/// use bouncer::KeyKind;
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = LimiterEvent::Allowed { kind: KeyKind::Credential, limit: 100, remaining: 99 };
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory sink with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.lock().clone()
    }

    /// Clears all stored events.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LimiterEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Deliver `event` to `sink`, ignoring readiness and call failures.
///
/// Telemetry never changes a decision.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}
