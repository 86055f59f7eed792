use crate::clock::{to_system_time, Clock, SystemClock};
use crate::limits::Limits;
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::{CallerKey, Decision, RateLimiter};
use crate::telemetry::{
    emit_best_effort, DenyReason, LimiterEvent, NullSink, StoreOperation, TelemetrySink,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Fixed-window limiter with a block penalty.
///
/// Each caller gets `limit_for(kind)` requests per window. The request that crosses the ceiling
/// places a block marker lasting `block`; while it exists every request is refused without
/// being counted. All state lives in the store, so any number of instances sharing it enforce
/// one quota.
pub struct FixedWindowLimiter<S, T = NullSink> {
    store: S,
    limits: Limits,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl<S> FixedWindowLimiter<S>
where
    S: CounterStore,
{
    /// Create a limiter backed by `store`.
    pub fn new(store: S, limits: Limits) -> Self {
        Self { store, limits, clock: Arc::new(SystemClock), sink: NullSink }
    }
}

impl<S, T> FixedWindowLimiter<S, T>
where
    S: CounterStore,
{
    /// Override the clock used to turn remaining lifetimes into instants.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a telemetry sink.
    pub fn with_sink<NewSink>(self, sink: NewSink) -> FixedWindowLimiter<S, NewSink>
    where
        NewSink: TelemetrySink,
    {
        FixedWindowLimiter { store: self.store, limits: self.limits, clock: self.clock, sink }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S, T> FixedWindowLimiter<S, T>
where
    S: CounterStore,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    async fn emit(&self, event: LimiterEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn store_failed(&self, key: &CallerKey, operation: StoreOperation, error: &S::Error) {
        tracing::error!(
            %key,
            operation = operation.as_str(),
            error = %error,
            "rate limit store failed"
        );
        self.emit(LimiterEvent::StoreFailed {
            kind: key.kind(),
            operation,
            error: error.to_string(),
        })
        .await;
    }
}

#[async_trait]
impl<S, T> RateLimiter for FixedWindowLimiter<S, T>
where
    S: CounterStore,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    type Error = S::Error;

    async fn allow(&self, key: &CallerKey) -> Result<Decision, Self::Error> {
        let limit = self.limits.limit_for(key.kind());

        let (blocked, remaining) = match self.store.is_blocked(key.value()).await {
            Ok(state) => state,
            Err(e) => {
                self.store_failed(key, StoreOperation::IsBlocked, &e).await;
                return Err(e);
            }
        };
        if blocked {
            let now = self.clock.now_millis();
            tracing::warn!(%key, limit, ?remaining, "request refused: caller is blocked");
            self.emit(LimiterEvent::Denied {
                kind: key.kind(),
                limit,
                reason: DenyReason::Blocked,
                retry_after: remaining,
            })
            .await;
            return Ok(Decision::blocked(limit, to_system_time(now) + remaining));
        }

        let (count, window_left) = match self.store.incr_request(key.value(), self.limits.window()).await {
            Ok(reply) => reply,
            Err(e) => {
                self.store_failed(key, StoreOperation::IncrRequest, &e).await;
                return Err(e);
            }
        };
        let now = to_system_time(self.clock.now_millis());
        tracing::debug!(%key, count, limit, ?window_left, "request counted");

        if count > limit {
            let block = self.limits.block();
            match self.store.block_request(key.value(), block).await {
                Ok(()) => {
                    tracing::info!(%key, count, limit, ?block, "rate limit exceeded; caller blocked");
                    self.emit(LimiterEvent::BlockPlaced { kind: key.kind(), duration: block }).await;
                }
                Err(e) => {
                    tracing::error!(%key, count, limit, error = %e, "rate limit exceeded; block marker not written");
                    self.emit(LimiterEvent::BlockNotPersisted { kind: key.kind(), error: e.to_string() })
                        .await;
                }
            }
            self.emit(LimiterEvent::Denied {
                kind: key.kind(),
                limit,
                reason: DenyReason::OverLimit,
                retry_after: block,
            })
            .await;
            return Ok(Decision::over_limit(limit, now + window_left, now + block));
        }

        let remaining = limit - count;
        self.emit(LimiterEvent::Allowed { kind: key.kind(), limit, remaining }).await;
        Ok(Decision::allowed(limit, remaining, now + window_left))
    }
}

impl<S: std::fmt::Debug, T> std::fmt::Debug for FixedWindowLimiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("store", &self.store)
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::MemorySink;
    use std::sync::Mutex;
    use std::time::{Duration, UNIX_EPOCH};
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("scripted failure in {0}")]
    struct ScriptedError(&'static str);

    /// Store double replying from fixed values and recording every call.
    #[derive(Debug, Default)]
    struct ScriptedStore {
        blocked: Option<Duration>,
        count: u64,
        window_left: Duration,
        fail_is_blocked: bool,
        fail_incr: bool,
        fail_block: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedStore {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CounterStore for ScriptedStore {
        type Error = ScriptedError;

        async fn is_blocked(&self, _key: &str) -> Result<(bool, Duration), Self::Error> {
            self.calls.lock().unwrap().push("is_blocked");
            if self.fail_is_blocked {
                return Err(ScriptedError("is_blocked"));
            }
            Ok(self.blocked.map_or((false, Duration::ZERO), |d| (true, d)))
        }

        async fn incr_request(&self, _key: &str, _window: Duration) -> Result<(u64, Duration), Self::Error> {
            self.calls.lock().unwrap().push("incr_request");
            if self.fail_incr {
                return Err(ScriptedError("incr_request"));
            }
            Ok((self.count, self.window_left))
        }

        async fn block_request(&self, _key: &str, _duration: Duration) -> Result<(), Self::Error> {
            self.calls.lock().unwrap().push("block_request");
            if self.fail_block {
                return Err(ScriptedError("block_request"));
            }
            Ok(())
        }
    }

    const NOW_MS: u64 = 1_700_000_000_000;

    type Scripted = FixedWindowLimiter<Arc<ScriptedStore>, MemorySink>;

    fn build(store: ScriptedStore) -> (Scripted, Arc<ScriptedStore>, MemorySink) {
        let store = Arc::new(store);
        let sink = MemorySink::new();
        let limits = Limits::new(5, 10, Duration::from_secs(60), Duration::from_secs(300)).unwrap();
        let limiter = FixedWindowLimiter::new(store.clone(), limits)
            .with_clock(Arc::new(ManualClock::new(NOW_MS)))
            .with_sink(sink.clone());
        (limiter, store, sink)
    }

    fn now() -> std::time::SystemTime {
        UNIX_EPOCH + Duration::from_millis(NOW_MS)
    }

    #[tokio::test]
    async fn allowed_reports_remaining_and_reset() {
        let (limiter, store, sink) = build(ScriptedStore {
            count: 2,
            window_left: Duration::from_secs(58),
            ..Default::default()
        });
        let decision = limiter.allow(&CallerKey::address("10.0.0.1")).await.unwrap();
        assert_eq!(decision, Decision::allowed(5, 3, now() + Duration::from_secs(58)));
        assert_eq!(store.calls(), vec!["is_blocked", "incr_request"]);
        assert!(matches!(sink.events()[..], [LimiterEvent::Allowed { remaining: 3, .. }]));
    }

    #[tokio::test]
    async fn credential_uses_its_own_ceiling() {
        let (limiter, _, _) = build(ScriptedStore {
            count: 6,
            window_left: Duration::from_secs(1),
            ..Default::default()
        });
        let decision = limiter.allow(&CallerKey::credential("tok")).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!((decision.limit(), decision.remaining()), (10, 4));
    }

    #[tokio::test]
    async fn blocked_caller_is_not_counted() {
        let (limiter, store, sink) = build(ScriptedStore {
            blocked: Some(Duration::from_secs(120)),
            ..Default::default()
        });
        let decision = limiter.allow(&CallerKey::address("10.0.0.1")).await.unwrap();
        assert_eq!(decision, Decision::blocked(5, now() + Duration::from_secs(120)));
        assert_eq!(store.calls(), vec!["is_blocked"]);
        assert!(matches!(
            sink.events()[..],
            [LimiterEvent::Denied { reason: DenyReason::Blocked, .. }]
        ));
    }

    #[tokio::test]
    async fn crossing_the_ceiling_places_a_block() {
        let (limiter, store, sink) = build(ScriptedStore {
            count: 6,
            window_left: Duration::from_secs(30),
            ..Default::default()
        });
        let decision = limiter.allow(&CallerKey::address("10.0.0.1")).await.unwrap();
        assert_eq!(
            decision,
            Decision::over_limit(5, now() + Duration::from_secs(30), now() + Duration::from_secs(300))
        );
        assert_eq!(store.calls(), vec!["is_blocked", "incr_request", "block_request"]);
        let events = sink.events();
        assert!(matches!(events[0], LimiterEvent::BlockPlaced { .. }));
        assert!(matches!(events[1], LimiterEvent::Denied { reason: DenyReason::OverLimit, .. }));
    }

    #[tokio::test]
    async fn failed_block_write_still_denies() {
        let (limiter, _, sink) = build(ScriptedStore {
            count: 9,
            window_left: Duration::from_secs(30),
            fail_block: true,
            ..Default::default()
        });
        let decision = limiter.allow(&CallerKey::address("10.0.0.1")).await.unwrap();
        assert!(!decision.is_allowed());
        assert_eq!(decision.remaining(), 0);
        assert!(matches!(sink.events()[0], LimiterEvent::BlockNotPersisted { .. }));
    }

    #[tokio::test]
    async fn store_errors_propagate_without_blocking() {
        let (limiter, store, sink) = build(ScriptedStore { fail_incr: true, ..Default::default() });
        let err = limiter.allow(&CallerKey::address("10.0.0.1")).await.unwrap_err();
        assert_eq!(err.to_string(), "scripted failure in incr_request");
        assert_eq!(store.calls(), vec!["is_blocked", "incr_request"]);
        assert!(matches!(
            sink.events()[..],
            [LimiterEvent::StoreFailed { operation: StoreOperation::IncrRequest, .. }]
        ));

        let (limiter, store, _) = build(ScriptedStore { fail_is_blocked: true, ..Default::default() });
        assert!(limiter.allow(&CallerKey::credential("tok")).await.is_err());
        assert_eq!(store.calls(), vec!["is_blocked"]);
    }

    #[tokio::test]
    async fn logs_never_contain_the_credential() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::DEBUG)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (limiter, _, _) = build(ScriptedStore {
            count: 11,
            window_left: Duration::from_secs(10),
            fail_block: true,
            ..Default::default()
        });
        limiter.allow(&CallerKey::credential("sk-live-123")).await.unwrap();

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("block marker not written"));
        assert!(logs.contains("credential:<redacted>"));
        assert!(!logs.contains("sk-live-123"));
    }

    #[tokio::test]
    async fn store_failure_behind_the_middleware_logs_one_error() {
        use crate::rate_limit::RateLimitLayer;
        use http::{Request, Response, StatusCode};
        use tower::{service_fn, Layer, ServiceExt};

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (limiter, _, _) = build(ScriptedStore { fail_incr: true, ..Default::default() });
        let svc = RateLimitLayer::new(limiter).layer(service_fn(|_req: Request<String>| async {
            Ok::<_, std::convert::Infallible>(Response::new(String::new()))
        }));
        let mut req = Request::new(String::new());
        req.extensions_mut().insert("10.0.0.1:1".parse::<std::net::SocketAddr>().unwrap());
        let response = svc.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let errors: Vec<&str> = logs.lines().filter(|line| line.contains("ERROR")).collect();
        assert_eq!(errors.len(), 1, "{logs}");
        assert!(errors[0].contains("rate limit store failed"));
        assert!(logs.lines().any(|line| line.contains("DEBUG") && line.contains("rate limiter unavailable")));
    }
}
