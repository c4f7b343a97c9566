//! The per-request admission and protection pipeline.
//!
//! A proxied request moves through
//! `RECEIVED -> ROUTE_MATCHED -> RATE_CHECKED -> BREAKER_GUARDED -> DISPATCHED -> RESPONDED`,
//! and any stage may jump straight to `RESPONDED` with an error body. Paths
//! that match no route never reach the guards and are not recorded in the
//! request metrics.
use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body as AxumBody,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderValue, Request, Response, Uri, header},
};
use http_body_util::BodyExt;
use tracing::Instrument;

use crate::{
    core::{
        circuit_breaker::BreakerError,
        context::{REQUEST_ID_HEADER, RequestContext},
        error::GatewayError,
        gateway::GatewayService,
        routes::Route,
    },
    metrics::RequestTimer,
    ports::http_client::HttpClient,
    tracing_setup::{create_request_span, log_response},
};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

pub struct RequestPipeline {
    gateway: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
}

impl RequestPipeline {
    pub fn new(gateway: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            gateway,
            http_client,
        }
    }

    fn include_stack(&self) -> bool {
        self.gateway.config().logging.is_debug()
    }

    /// Run one inbound request through the pipeline. Never fails: every
    /// error becomes a JSON error response carrying the request id.
    pub async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let ctx = RequestContext::from_request(&req, self.gateway.config().security.trust_proxy);

        let Some(route) = self
            .gateway
            .routes()
            .find_matching_route(req.uri().path())
            .cloned()
        else {
            tracing::debug!(request_id = %ctx.request_id, path = %req.uri().path(), "No route matched");
            let err = GatewayError::RouteNotFound {
                path: req.uri().path().to_string(),
            };
            return err.to_response(&ctx.request_id, self.include_stack());
        };

        let ctx = ctx.with_route(route.prefix());
        let span = create_request_span(ctx.method.as_str(), &ctx.url, &ctx.request_id, route.prefix());
        self.proxy(req, ctx, route).instrument(span).await
    }

    async fn proxy(&self, req: Request<AxumBody>, ctx: RequestContext, route: Arc<Route>) -> Response<AxumBody> {
        let headers = req.headers();
        tracing::info!(
            method = %ctx.method,
            url = %ctx.url,
            client_ip = %ctx.client_ip,
            user_agent = header_str(headers, header::USER_AGENT),
            content_type = header_str(headers, header::CONTENT_TYPE),
            content_length = header_str(headers, header::CONTENT_LENGTH),
            query = req.uri().query().unwrap_or_default(),
            "REQUEST"
        );

        // Records exactly once, when the response body is finished or dropped.
        let mut timer = RequestTimer::new(
            self.gateway.metrics().clone(),
            ctx.method.as_str(),
            route.prefix(),
        );

        let decision = match self.gateway.rate_limiter() {
            Some(limiter) => Some(limiter.check(&ctx.client_ip, route.prefix()).await),
            None => None,
        };

        let result = match decision {
            Some(decision) if !decision.allowed => Err(GatewayError::RateLimitExceeded {
                retry_after: decision.reset_after,
            }),
            _ => self.dispatch(req, &ctx, &route).await,
        };

        let mut response = result.unwrap_or_else(|err| {
            if matches!(err, GatewayError::RateLimitExceeded { .. }) {
                tracing::warn!(client_ip = %ctx.client_ip, "Rate limit exceeded");
            } else {
                tracing::error!(error = %err, code = err.code(), "Request failed");
            }
            err.to_response(&ctx.request_id, self.include_stack())
        });

        if let Some(decision) = decision {
            decision.apply_headers(response.headers_mut());
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        timer.set_status(response.status().as_u16());
        log_response(
            response.status(),
            ctx.start_time.elapsed().as_millis() as u64,
            "RESPONSE",
        );
        record_on_body_end(response, timer)
    }

    /// Forward through the route's breaker. Backend 5xx responses are
    /// relayed to the client but count as failures.
    async fn dispatch(
        &self,
        req: Request<AxumBody>,
        ctx: &RequestContext,
        route: &Route,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let upstream = build_upstream_request(req, ctx, route)?;
        let client = &self.http_client;

        self.gateway
            .breakers()
            .fire_classified(
                route.prefix(),
                move || client.send_request(upstream),
                |response: &Response<AxumBody>| !response.status().is_server_error(),
            )
            .await
            .map_err(|err| match err {
                BreakerError::Open { route } => GatewayError::CircuitOpen { route },
                BreakerError::Timeout { route, after } => GatewayError::BackendTimeout { route, after },
                BreakerError::Inner(source) => GatewayError::BackendUnavailable {
                    route: route.prefix().to_string(),
                    source,
                },
                BreakerError::UnknownRoute(route) => GatewayError::Internal {
                    detail: format!("no circuit breaker registered for route '{route}'"),
                },
            })
    }
}

/// Rewrite the inbound request for the backend: upstream URI, forwarding
/// headers and the correlation id.
fn build_upstream_request(
    req: Request<AxumBody>,
    ctx: &RequestContext,
    route: &Route,
) -> Result<Request<AxumBody>, GatewayError> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let (mut parts, body) = req.into_parts();

    let upstream = route.upstream_url(&ctx.url);
    parts.uri = upstream.parse::<Uri>().map_err(|e| GatewayError::Internal {
        detail: format!("invalid upstream URI '{upstream}': {e}"),
    })?;

    add_forwarding_headers(&mut parts.headers, peer.as_deref().unwrap_or(&ctx.client_ip));
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        parts.headers.insert(REQUEST_ID_HEADER, value);
    }

    Ok(Request::from_parts(parts, body))
}

/// Move `timer` into the response body so the observation covers the body
/// transfer and fires when the body completes or the client goes away.
fn record_on_body_end(response: Response<AxumBody>, timer: RequestTimer) -> Response<AxumBody> {
    response.map(|body| {
        AxumBody::new(body.map_frame(move |frame| {
            let _timer = &timer;
            frame
        }))
    })
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn add_forwarding_headers(headers: &mut HeaderMap, client_ip: &str) {
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if !headers.contains_key(X_FORWARDED_HOST)
        && let Some(host) = headers.get(header::HOST).cloned()
    {
        headers.insert(X_FORWARDED_HOST, host);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::Value;

    use super::*;
    use crate::{
        config::{CorsOptions, EnvironmentConfig, RateLimitConfig, RouteConfig},
        core::circuit_breaker::BreakerState,
        ports::http_client::{HttpClientError, HttpClientResult, ProbeResponse},
    };

    /// Backend double answering every call with a fixed status, or failing.
    struct StubBackend {
        status: Option<StatusCode>,
        delay: Duration,
        calls: AtomicUsize,
        last_uri: std::sync::Mutex<Option<String>>,
        last_headers: std::sync::Mutex<HeaderMap>,
    }

    impl StubBackend {
        fn new(status: Option<StatusCode>) -> Arc<Self> {
            Self::with_delay(status, Duration::ZERO)
        }

        fn with_delay(status: Option<StatusCode>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                status,
                delay,
                calls: AtomicUsize::new(0),
                last_uri: std::sync::Mutex::new(None),
                last_headers: std::sync::Mutex::new(HeaderMap::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for StubBackend {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_uri.lock().unwrap() = Some(req.uri().to_string());
            *self.last_headers.lock().unwrap() = req.headers().clone();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.status {
                Some(status) => Ok(Response::builder()
                    .status(status)
                    .body(AxumBody::from("backend"))
                    .unwrap()),
                None => Err(HttpClientError::ConnectionError("refused".to_string())),
            }
        }

        async fn probe(&self, _url: &str, _timeout: Duration) -> HttpClientResult<ProbeResponse> {
            unreachable!("pipeline never probes")
        }
    }

    fn gateway(max: u32, route_timeout_ms: u64) -> Arc<GatewayService> {
        let mut config = EnvironmentConfig {
            port: Some(3000),
            cors_options: Some(CorsOptions::default()),
            rate_limit: RateLimitConfig {
                window_ms: 60_000,
                max,
            },
            routes: Some(vec![RouteConfig {
                prefix: Some("/users".to_string()),
                target: Some("http://users.internal:3001".to_string()),
                timeout: Some(route_timeout_ms),
                health_check: "/health".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        config.circuit_breaker.volume_threshold = 2;
        Arc::new(GatewayService::new(Arc::new(config)).unwrap())
    }

    fn request(path: &str) -> Request<AxumBody> {
        Request::builder()
            .uri(path)
            .header(header::HOST, "gateway.test")
            .header("x-forwarded-for", "203.0.113.7")
            .body(AxumBody::empty())
            .unwrap()
    }

    async fn error_body(response: Response<AxumBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn recorded(gateway: &GatewayService, status: &str) -> Option<f64> {
        gateway.metrics().requests_total().get(&[
            ("method", "GET"),
            ("route", "/users"),
            ("status_code", status),
        ])
    }

    #[tokio::test]
    async fn proxies_and_annotates_successful_requests() {
        let gateway = gateway(10, 1000);
        let backend = StubBackend::new(Some(StatusCode::OK));
        let pipeline = RequestPipeline::new(gateway.clone(), backend.clone());

        let response = pipeline
            .handle(
                Request::builder()
                    .uri("/users/42?full=1")
                    .header(header::HOST, "gateway.test")
                    .header(REQUEST_ID_HEADER, "req-abc")
                    .body(AxumBody::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-abc");
        assert_eq!(response.headers()["ratelimit-limit"], "10");
        assert_eq!(response.headers()["ratelimit-remaining"], "9");
        assert_eq!(
            backend.last_uri.lock().unwrap().as_deref(),
            Some("http://users.internal:3001/users/42?full=1")
        );
        let headers = backend.last_headers.lock().unwrap().clone();
        assert_eq!(headers[REQUEST_ID_HEADER], "req-abc");
        assert_eq!(headers[X_FORWARDED_HOST], "gateway.test");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");

        drop(response);
        assert_eq!(recorded(&gateway, "200"), Some(1.0));
    }

    #[tokio::test]
    async fn observation_waits_for_the_response_body() {
        let gateway = gateway(10, 1000);
        let backend = StubBackend::new(Some(StatusCode::OK));
        let pipeline = RequestPipeline::new(gateway.clone(), backend.clone());

        let response = pipeline.handle(request("/users")).await;
        assert_eq!(recorded(&gateway, "200"), None);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"backend");
        assert_eq!(recorded(&gateway, "200"), Some(1.0));
        let labels = [("method", "GET"), ("route", "/users"), ("status_code", "200")];
        assert_eq!(
            gateway.metrics().request_duration().snapshot(&labels).unwrap().count,
            1
        );
    }

    #[tokio::test]
    async fn unmatched_paths_bypass_guards_and_metrics() {
        let gateway = gateway(10, 1000);
        let backend = StubBackend::new(Some(StatusCode::OK));
        let pipeline = RequestPipeline::new(gateway.clone(), backend.clone());

        let response = pipeline.handle(request("/unknown")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("ratelimit-limit").is_none());
        assert_eq!(backend.calls(), 0);
        assert!(!gateway.metrics().exposition().contains("/unknown"));
    }

    #[tokio::test]
    async fn rate_limited_requests_get_429_and_are_recorded() {
        let gateway = gateway(1, 1000);
        let backend = StubBackend::new(Some(StatusCode::OK));
        let pipeline = RequestPipeline::new(gateway.clone(), backend.clone());

        assert_eq!(pipeline.handle(request("/users")).await.status(), StatusCode::OK);
        let response = pipeline.handle(request("/users")).await;

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["ratelimit-remaining"], "0");
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        let request_id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        let body = error_body(response).await;
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["error"]["requestId"], request_id.as_str());

        assert_eq!(backend.calls(), 1);
        assert_eq!(recorded(&gateway, "429"), Some(1.0));
    }

    #[tokio::test]
    async fn backend_failures_open_the_circuit() {
        let gateway = gateway(100, 1000);
        let backend = StubBackend::new(None);
        let pipeline = RequestPipeline::new(gateway.clone(), backend.clone());

        for _ in 0..2 {
            let response = pipeline.handle(request("/users")).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(error_body(response).await["error"]["code"], "SERVICE_UNAVAILABLE");
        }
        assert_eq!(
            gateway.breakers().get("/users").unwrap().state(),
            BreakerState::Open
        );

        let response = pipeline.handle(request("/users")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_body(response).await["error"]["code"], "CIRCUIT_OPEN");
        assert_eq!(backend.calls(), 2);
        assert_eq!(recorded(&gateway, "503"), Some(3.0));
    }

    #[tokio::test]
    async fn backend_server_errors_are_relayed_and_counted() {
        let gateway = gateway(100, 1000);
        let backend = StubBackend::new(Some(StatusCode::BAD_GATEWAY));
        let pipeline = RequestPipeline::new(gateway.clone(), backend.clone());

        for _ in 0..2 {
            assert_eq!(
                pipeline.handle(request("/users")).await.status(),
                StatusCode::BAD_GATEWAY
            );
        }
        assert_eq!(
            gateway.breakers().get("/users").unwrap().state(),
            BreakerState::Open
        );
        assert_eq!(recorded(&gateway, "502"), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backends_time_out() {
        let gateway = gateway(100, 50);
        let backend = StubBackend::with_delay(Some(StatusCode::OK), Duration::from_secs(5));
        let pipeline = RequestPipeline::new(gateway.clone(), backend.clone());

        let response = pipeline.handle(request("/users")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = error_body(response).await;
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(recorded(&gateway, "503"), Some(1.0));
    }

    #[test]
    fn forwarding_headers_append_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1"));
        headers.insert(header::HOST, HeaderValue::from_static("api.example.com"));
        add_forwarding_headers(&mut headers, "10.0.0.2");

        assert_eq!(headers[X_FORWARDED_FOR], "198.51.100.1, 10.0.0.2");
        assert_eq!(headers[X_FORWARDED_HOST], "api.example.com");
    }
}
