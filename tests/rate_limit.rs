use async_trait::async_trait;
use bouncer::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn limits() -> Limits {
    Limits::new(5, 10, Duration::from_secs(60), Duration::from_secs(300)).expect("valid limits")
}

fn setup() -> (FixedWindowLimiter<InMemoryCounterStore>, InMemoryCounterStore, ManualClock) {
    let clock = ManualClock::new(1_700_000_000_000);
    let store = InMemoryCounterStore::new().with_clock(clock.clone());
    let limiter = FixedWindowLimiter::new(store.clone(), limits()).with_clock(Arc::new(clock.clone()));
    (limiter, store, clock)
}

#[tokio::test]
async fn remaining_counts_down_then_blocks_for_the_full_penalty() {
    let (limiter, store, clock) = setup();
    let key = CallerKey::address("192.168.1.1");

    let mut remaining = Vec::new();
    for _ in 0..5 {
        let d = limiter.allow(&key).await.unwrap();
        assert!(d.is_allowed());
        assert_eq!(d.reset_at(), Some(clock.now() + Duration::from_secs(60)));
        remaining.push(d.remaining());
    }
    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

    let sixth = limiter.allow(&key).await.unwrap();
    assert!(!sixth.is_allowed());
    assert_eq!(sixth.remaining(), 0);
    assert_eq!(sixth.retry_at(), Some(clock.now() + Duration::from_secs(300)));
    assert_eq!(store.is_blocked(key.value()).await.unwrap(), (true, Duration::from_secs(300)));

    // The window has long expired, the block has not.
    clock.advance(Duration::from_secs(120));
    let d = limiter.allow(&key).await.unwrap();
    assert!(!d.is_allowed());
    assert_eq!(d.retry_after(clock.now()), Duration::from_secs(180));

    // Blocked requests are not counted: once the block ends the key starts over.
    clock.advance(Duration::from_secs(180));
    let d = limiter.allow(&key).await.unwrap();
    assert!(d.is_allowed());
    assert_eq!(d.remaining(), 4);
}

#[tokio::test]
async fn window_expiry_restores_the_quota() {
    let (limiter, _store, clock) = setup();
    let key = CallerKey::address("10.1.1.1");
    for _ in 0..4 {
        limiter.allow(&key).await.unwrap();
    }
    clock.advance(Duration::from_secs(30));
    let d = limiter.allow(&key).await.unwrap();
    assert_eq!(d.remaining(), 0);
    assert_eq!(d.reset_at(), Some(clock.now() + Duration::from_secs(30)), "window is not extended");

    clock.advance(Duration::from_secs(30));
    let d = limiter.allow(&key).await.unwrap();
    assert_eq!(d.remaining(), 4);
}

#[tokio::test]
async fn each_classification_gets_its_own_ceiling() {
    let (limiter, _store, _clock) = setup();
    let address = CallerKey::address("172.16.0.9");
    let credential = CallerKey::credential("abc123");

    for expected in (0..10).rev() {
        let d = limiter.allow(&credential).await.unwrap();
        assert_eq!((d.limit(), d.remaining()), (10, expected));
    }
    assert!(!limiter.allow(&credential).await.unwrap().is_allowed());

    // The credential's block does not touch the address.
    let d = limiter.allow(&address).await.unwrap();
    assert_eq!((d.limit(), d.remaining()), (5, 4));
}

#[tokio::test]
async fn concurrent_callers_observe_distinct_counts() {
    let (limiter, _store, _clock) = setup();
    let limiter = Arc::new(limiter.with_sink(MemorySink::new()));
    let key = CallerKey::credential("shared-token");

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            tokio::spawn(async move { limiter.allow(&key).await.unwrap() })
        })
        .collect();
    let mut remaining: Vec<u64> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .inspect(|d| assert!(d.is_allowed()))
        .map(|d| d.remaining())
        .collect();
    remaining.sort_unstable();
    assert_eq!(remaining, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn telemetry_reports_every_decision() {
    let (limiter, _store, _clock) = setup();
    let sink = MemorySink::new();
    let limiter = limiter.with_sink(sink.clone());
    let key = CallerKey::address("10.9.9.9");
    for _ in 0..6 {
        limiter.allow(&key).await.unwrap();
    }

    let events = sink.events();
    let allowed = events.iter().filter(|e| matches!(e, LimiterEvent::Allowed { .. })).count();
    assert_eq!(allowed, 5);
    assert!(events.iter().any(|e| matches!(e, LimiterEvent::BlockPlaced { .. })));
    assert!(matches!(events.last(), Some(LimiterEvent::Denied { .. })));
}

#[derive(Debug, thiserror::Error)]
#[error("connection reset")]
struct ConnectionReset;

/// Memory store whose increments always fail.
#[derive(Debug, Clone)]
struct BrokenCounter(InMemoryCounterStore);

#[async_trait]
impl CounterStore for BrokenCounter {
    type Error = ConnectionReset;

    async fn is_blocked(&self, key: &str) -> Result<(bool, Duration), Self::Error> {
        Ok(self.0.is_blocked(key).await.unwrap_or((false, Duration::ZERO)))
    }

    async fn incr_request(&self, _key: &str, _window: Duration) -> Result<(u64, Duration), Self::Error> {
        Err(ConnectionReset)
    }

    async fn block_request(&self, key: &str, duration: Duration) -> Result<(), Self::Error> {
        self.0.block_request(key, duration).await.map_err(|never| match never {})
    }
}

#[tokio::test]
async fn store_failure_is_an_error_and_never_blocks() {
    let inner = InMemoryCounterStore::new();
    let limiter = FixedWindowLimiter::new(BrokenCounter(inner.clone()), limits());
    let key = CallerKey::address("10.0.0.3");

    for _ in 0..10 {
        let err = limiter.allow(&key).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }
    assert_eq!(inner.is_blocked(key.value()).await.unwrap(), (false, Duration::ZERO));
    assert!(inner.is_empty());
}
