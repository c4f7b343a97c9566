// End-to-end checks of the gateway router against real backend servers.
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use fgateway::{
    DashboardRenderer, FileSystemAdapter, GatewayService, HttpClientAdapter, HttpHandler,
    adapters::build_router, config::loader::load_config_sync,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header_exists, method, path},
};

const ASSETS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/public/metrics-dashboard");
const TEMPLATE: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/public/metrics-dashboard/template.html"
);

fn gateway_app(routes: &str, extra: &str) -> (Router, Arc<GatewayService>) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.config.json");
    let json = format!(
        r#"{{
  "test": {{
    "port": 3000,
    "corsOptions": {{ "origin": "*", "exposedHeaders": ["X-Request-ID"] }},
    "rateLimit": {{ "windowMs": 60000, "max": 100 }},
    "routes": [{routes}],
    "logging": {{ "level": "info" }},
    "healthCheck": {{ "timeout": 300 }},
    "dashboard": {{ "assetsDir": "{ASSETS_DIR}", "template": "{TEMPLATE}" }}{extra}
  }}
}}"#
    );
    std::fs::write(&path, json).unwrap();

    let config = load_config_sync(path.to_str().unwrap(), "test", None).unwrap();
    let config = Arc::new(config);
    let gateway = Arc::new(GatewayService::new(config.clone()).unwrap());
    let handler = HttpHandler::new(
        gateway.clone(),
        Arc::new(HttpClientAdapter::new().unwrap()),
        Arc::new(DashboardRenderer::new(&config.dashboard.template)),
        Arc::new(FileSystemAdapter::new()),
    );
    (build_router(Arc::new(handler)), gateway)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn proxies_to_backend_and_records_metrics() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/42"))
        .and(header_exists("x-request-id"))
        .and(header_exists("x-forwarded-for"))
        .respond_with(ResponseTemplate::new(200).set_body_string("alice"))
        .expect(1)
        .mount(&backend)
        .await;

    let routes = format!(r#"{{ "prefix": "/users", "target": "{}" }}"#, backend.uri());
    let (app, gateway) = gateway_app(&routes, "");

    let mut req = get("/users/42");
    req.headers_mut()
        .insert("x-request-id", "trace-123".parse().unwrap());
    let response = app.clone().oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "trace-123");
    assert_eq!(response.headers()["ratelimit-limit"], "100");
    assert_eq!(response.headers()["ratelimit-remaining"], "99");
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"alice");

    let text = gateway.metrics().exposition();
    assert!(text.contains(
        r#"http_requests_total{method="GET",route="/users",status_code="200"} 1"#
    ));

    let mut req = get("/metrics");
    req.headers_mut()
        .insert(header::ACCEPT, "application/json".parse().unwrap());
    let json = json_body(app.clone().oneshot(req).await.unwrap()).await;
    let route = &json["routes"][0];
    assert_eq!(route["route"], "/users");
    let totals = route["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == "http_requests_total")
        .unwrap();
    assert_eq!(totals["hasRouteSamples"], true);
    assert_eq!(totals["routeSamples"][0]["statusClass"], "status-2xx");
    assert_eq!(totals["routeSamples"][0]["formattedValue"], "1.0000");

    let mut req = get("/metrics");
    req.headers_mut()
        .insert(header::ACCEPT, "text/html".parse().unwrap());
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = response.into_body().collect().await.unwrap().to_bytes();
    let html = String::from_utf8(html.to_vec()).unwrap();
    assert!(html.contains(r#"data-metric="http_requests_total""#));
    assert!(html.contains("status-2xx"));
}

#[tokio::test]
async fn route_rate_limit_rejects_and_still_counts() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&backend)
        .await;

    let routes = format!(
        r#"{{ "prefix": "/orders", "target": "{}", "rateLimitOverride": {{ "windowMs": 60000, "max": 2 }} }}"#,
        backend.uri()
    );
    let (app, gateway) = gateway_app(&routes, "");

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/orders")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.oneshot(get("/orders")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(response.headers()["ratelimit-remaining"], "0");
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");
    assert!(json["error"]["requestId"].as_str().is_some());

    let text = gateway.metrics().exposition();
    assert!(text.contains(
        r#"http_requests_total{method="GET",route="/orders",status_code="200"} 2"#
    ));
    assert!(text.contains(
        r#"http_requests_total{method="GET",route="/orders",status_code="429"} 1"#
    ));
}

#[tokio::test]
async fn failing_backend_opens_the_circuit() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&backend)
        .await;

    let routes = format!(r#"{{ "prefix": "/billing", "target": "{}" }}"#, backend.uri());
    let breaker = r#",
    "circuitBreaker": { "errorThresholdPercentage": 50, "volumeThreshold": 2, "resetTimeout": 60000 }"#;
    let (app, gateway) = gateway_app(&routes, breaker);

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/billing/invoices")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    let response = app.oneshot(get("/billing/invoices")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = json_body(response).await;
    assert_eq!(json["error"]["code"], "CIRCUIT_OPEN");

    let snapshot = gateway.breakers().get("/billing").unwrap().snapshot();
    assert_eq!(snapshot.state.to_string(), "OPEN");
}

#[tokio::test]
async fn health_reports_each_backend_independently() {
    let users = MockServer::start().await;
    Mock::given(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&users)
        .await;
    let orders = MockServer::start().await;
    Mock::given(path("/status"))
        .respond_with(ResponseTemplate::new(200).insert_header("x-response-time", "7ms"))
        .mount(&orders)
        .await;
    let slow = MockServer::start().await;
    Mock::given(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&slow)
        .await;

    let routes = format!(
        r#"{{ "prefix": "/users", "target": "{}" }},
        {{ "prefix": "/orders", "target": "{}", "healthCheckPath": "/status" }},
        {{ "prefix": "/slow", "target": "{}" }}"#,
        users.uri(),
        orders.uri(),
        slow.uri()
    );
    let (app, _) = gateway_app(&routes, "");

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;

    let services = json["services"].as_object().unwrap();
    assert_eq!(services.len(), 3);
    assert_eq!(services["/users"]["status"], "up");
    assert_eq!(services["/orders"]["status"], "up");
    assert_eq!(services["/orders"]["responseTime"], "7ms");
    assert_eq!(services["/slow"]["status"], "down");
    assert!(services["/slow"]["error"].as_str().is_some());
}

#[tokio::test]
async fn dashboard_assets_are_served_from_assets_dir() {
    let routes = r#"{ "prefix": "/users", "target": "http://127.0.0.1:1" }"#;
    let extra = r#",
    "security": { "enableHelmet": false }"#;
    let (app, _) = gateway_app(routes, extra);

    let response = app
        .clone()
        .oneshot(get("/metrics-dashboard/js/metrics-dashboard.js"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-frame-options"));

    let response = app
        .oneshot(get("/metrics-dashboard/missing.css"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
