//! Tower middleware enforcing the limiter on `http` services.
//!
//! Allowed requests reach the inner service and get `X-RateLimit-*` headers on the way out.
//! Denied requests are answered with `429 Too Many Requests` and a JSON body; limiter failures
//! with a generic `500`. Neither reaches the inner service.

use crate::clock::{Clock, SystemClock};
use crate::rate_limit::{Decision, KeyExtractor, RateLimiter};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_layer::Layer;
use tower_service::Service;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const DENIED_MESSAGE: &str = "you have reached the maximum number of requests or actions allowed \
                              within a certain time frame";
const INTERNAL_ERROR_BODY: &str =
    r#"{"error":"internal_error","message":"internal server error"}"#;

/// Body of a `429` response.
#[derive(Debug, Serialize)]
struct DeniedBody {
    error: &'static str,
    message: &'static str,
    limit: u64,
    remaining: u64,
    /// Whole seconds until the caller may retry.
    reset_after: u64,
}

/// A layer that enforces rate limits using a [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    extractor: KeyExtractor,
    clock: Arc<dyn Clock>,
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer classifying callers with the default [`KeyExtractor`].
    pub fn new(limiter: L) -> Self {
        Self::from_shared(Arc::new(limiter))
    }

    /// Share one limiter between several layers.
    pub fn from_shared(limiter: Arc<L>) -> Self {
        Self { limiter, extractor: KeyExtractor::default(), clock: Arc::new(SystemClock) }
    }

    pub fn with_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Clock used to compute `Retry-After`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), extractor: self.extractor.clone(), clock: self.clock.clone() }
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    extractor: KeyExtractor,
    clock: Arc<dyn Clock>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        let clock = self.clock.clone();
        let key = self.extractor.extract(&req);
        // The clone may not be ready; keep the instance poll_ready was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = match limiter.allow(&key).await {
                Ok(decision) => decision,
                Err(e) => {
                    // FixedWindowLimiter already logs store failures at error level.
                    tracing::debug!(%key, error = %e, "rate limiter unavailable; rejecting request");
                    return Ok(internal_error());
                }
            };

            if !decision.is_allowed() {
                return Ok(too_many_requests(&decision, clock.now()));
            }

            let mut response = inner.call(req).await?;
            set_rate_limit_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit()));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    if let Some(at) = decision.next_reset() {
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(unix_seconds(at)));
    }
}

fn too_many_requests<B: From<String>>(decision: &Decision, now: SystemTime) -> Response<B> {
    let retry_after = whole_seconds_ceil(decision.retry_after(now));
    let body = DeniedBody {
        error: "rate_limit_exceeded",
        message: DENIED_MESSAGE,
        limit: decision.limit(),
        remaining: 0,
        reset_after: retry_after,
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| String::from(r#"{"error":"rate_limit_exceeded"}"#));

    let mut response = Response::new(B::from(json));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    set_rate_limit_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn internal_error<B: From<String>>() -> Response<B> {
    let mut response = Response::new(B::from(INTERNAL_ERROR_BODY.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn unix_seconds(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn whole_seconds_ceil(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
