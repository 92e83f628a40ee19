//! Fixed-window request limiting per client and route class.

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use futures::future::BoxFuture;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::{Layer, Service};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub query_per_minute: u64,
    pub account_per_minute: u64,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            query_per_minute: 60,
            account_per_minute: 20,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    fn limit_for(&self, class: RateClass) -> u64 {
        match class {
            RateClass::Query => self.query_per_minute,
            RateClass::Account => self.account_per_minute,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitLayer {
    state: Arc<RateLimitState>,
}

pub fn rate_limit_layer(config: RateLimitConfig) -> RateLimitLayer {
    RateLimitLayer {
        state: Arc::new(RateLimitState::new(config)),
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    state: Arc<RateLimitState>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RateLimitService<S>
where
    S: Service<Request<ReqBody>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // The clone is not guaranteed ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let state = self.state.clone();
        let admission = admission_key(&request);

        Box::pin(async move {
            if let Some((class, identity)) = admission {
                if let Err(rejection) = state.check(class, identity).await {
                    return Ok(rejection.into_response());
                }
            }
            inner.call(request).await
        })
    }
}

#[derive(Debug)]
struct RateLimitState {
    config: RateLimitConfig,
    counters: Mutex<Counters>,
}

#[derive(Debug)]
struct Counters {
    windows: HashMap<(RateClass, String), Window>,
    last_sweep: Instant,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u64,
}

impl RateLimitState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Mutex::new(Counters {
                windows: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    async fn check(&self, class: RateClass, identity: String) -> Result<(), RateLimitRejection> {
        let window = self.config.window;
        let limit = self.config.limit_for(class);
        if limit == 0 {
            return Err(RateLimitRejection {
                class,
                limit,
                window,
                retry_after: window,
            });
        }

        let now = Instant::now();
        let mut counters = self.counters.lock().await;

        // Expired windows are swept at most once per window length.
        if now.saturating_duration_since(counters.last_sweep) >= window {
            counters
                .windows
                .retain(|_, entry| now.saturating_duration_since(entry.started) < window);
            counters.last_sweep = now;
        }

        let entry = counters
            .windows
            .entry((class, identity.clone()))
            .or_insert(Window {
                started: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            warn!(
                class = class.as_str(),
                client_fingerprint = %identity,
                limit,
                "rate limit exceeded"
            );
            return Err(RateLimitRejection {
                class,
                limit,
                window,
                retry_after: window.saturating_sub(elapsed),
            });
        }

        entry.count += 1;
        Ok(())
    }

    #[cfg(test)]
    async fn tracked_windows(&self) -> usize {
        self.counters.lock().await.windows.len()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum RateClass {
    Query,
    Account,
}

impl RateClass {
    fn as_str(self) -> &'static str {
        match self {
            RateClass::Query => "query",
            RateClass::Account => "account",
        }
    }
}

fn classify(path: &str) -> Option<RateClass> {
    if path == "/api/v1/query" {
        Some(RateClass::Query)
    } else if path.starts_with("/api/v1/accounts") {
        Some(RateClass::Account)
    } else {
        None
    }
}

/// Route class and client identity for limited paths, `None` for everything else.
fn admission_key<B>(request: &Request<B>) -> Option<(RateClass, String)> {
    classify(request.uri().path()).map(|class| (class, client_fingerprint(request)))
}

/// Hash of the peer address, so raw client IPs never reach the logs.
fn client_fingerprint<B>(request: &Request<B>) -> String {
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => {
            STANDARD_NO_PAD.encode(Sha256::digest(addr.ip().to_string().as_bytes()))
        }
        None => "anonymous".to_string(),
    }
}

#[derive(Debug)]
struct RateLimitRejection {
    class: RateClass,
    limit: u64,
    window: Duration,
    retry_after: Duration,
}

#[derive(Serialize)]
struct RateLimitBody {
    error: &'static str,
    category: &'static str,
    limit: u64,
    window_seconds: u64,
    retry_after_seconds: u64,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let retry_after_seconds = self.retry_after.as_secs().max(1);
        let body = RateLimitBody {
            error: "rate_limit_exceeded",
            category: self.class.as_str(),
            limit: self.limit,
            window_seconds: self.window.as_secs(),
            retry_after_seconds,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn request(path: &str, peer: Option<[u8; 4]>) -> Request<()> {
        let mut request = Request::builder().uri(path).body(()).unwrap();
        if let Some(octets) = peer {
            request.extensions_mut().insert(ConnectInfo(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(octets)),
                40_000,
            )));
        }
        request
    }

    fn state(query: u64, account: u64) -> RateLimitState {
        state_with_window(query, account, Duration::from_secs(60))
    }

    fn state_with_window(query: u64, account: u64, window: Duration) -> RateLimitState {
        RateLimitState::new(RateLimitConfig {
            query_per_minute: query,
            account_per_minute: account,
            window,
        })
    }

    async fn admit(state: &RateLimitState, request: &Request<()>) -> Result<(), RateLimitRejection> {
        match admission_key(request) {
            Some((class, identity)) => state.check(class, identity).await,
            None => Ok(()),
        }
    }

    #[test]
    fn classifies_routes() {
        assert_eq!(classify("/api/v1/query"), Some(RateClass::Query));
        assert_eq!(classify("/api/v1/accounts"), Some(RateClass::Account));
        assert_eq!(classify("/api/v1/accounts/login"), Some(RateClass::Account));
        assert_eq!(classify("/healthz"), None);
    }

    #[tokio::test]
    async fn limits_each_client_separately() {
        let state = state(2, 5);
        let first = request("/api/v1/query", Some([10, 0, 0, 1]));

        admit(&state, &first).await.unwrap();
        admit(&state, &first).await.unwrap();
        let rejection = admit(&state, &first).await.unwrap_err();
        assert_eq!(rejection.class, RateClass::Query);
        assert_eq!(rejection.limit, 2);

        let other = request("/api/v1/query", Some([10, 0, 0, 2]));
        admit(&state, &other).await.unwrap();

        // Separate class, separate budget.
        admit(&state, &request("/api/v1/accounts/login", Some([10, 0, 0, 1])))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unclassified_paths_are_never_limited() {
        let state = state(0, 0);
        for _ in 0..10 {
            admit(&state, &request("/healthz", None)).await.unwrap();
        }
        assert!(admit(&state, &request("/api/v1/query", None)).await.is_err());
    }

    #[tokio::test]
    async fn expired_windows_are_evicted() {
        let state = state_with_window(5, 5, Duration::from_millis(1));
        for host in 0..1_000u32 {
            let [_, a, b, c] = host.to_be_bytes();
            admit(&state, &request("/api/v1/query", Some([10, a, b, c])))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        admit(&state, &request("/api/v1/query", Some([192, 168, 0, 1])))
            .await
            .unwrap();
        assert_eq!(state.tracked_windows().await, 1);
    }

    #[tokio::test]
    async fn layer_limits_requests_through_a_service() {
        use tower::{service_fn, ServiceExt};

        let inner = service_fn(|_request: Request<axum::body::Body>| async {
            Ok::<_, Infallible>(StatusCode::OK.into_response())
        });
        let service = rate_limit_layer(RateLimitConfig {
            query_per_minute: 1,
            ..RateLimitConfig::default()
        })
        .layer(inner);

        let call = |service: RateLimitService<_>| async move {
            let request = Request::builder()
                .uri("/api/v1/query")
                .body(axum::body::Body::empty())
                .unwrap();
            service.oneshot(request).await.unwrap().status()
        };
        assert_eq!(call(service.clone()).await, StatusCode::OK);
        assert_eq!(call(service).await, StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn rejection_sets_retry_after() {
        let response = RateLimitRejection {
            class: RateClass::Account,
            limit: 20,
            window: Duration::from_secs(60),
            retry_after: Duration::from_millis(300),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn fingerprint_hides_the_peer_address() {
        let fingerprint = client_fingerprint(&request("/api/v1/query", Some([192, 168, 1, 7])));
        assert!(!fingerprint.contains("192.168"));
        assert_eq!(client_fingerprint(&request("/api/v1/query", None)), "anonymous");
    }
}
