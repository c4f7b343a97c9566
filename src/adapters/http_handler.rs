use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::Request,
    http::{HeaderMap, Method, StatusCode, header},
    middleware,
    routing::any,
};
use eyre::{Result, WrapErr};
use hyper::Response;
use serde::Serialize;

use crate::{
    adapters::{
        FileSystemAdapter, HealthChecker,
        middleware::{create_cors_middleware, security_headers_middleware},
    },
    core::{GatewayService, RequestPipeline},
    ports::{file_system::FileSystem, http_client::HttpClient, template::TemplateRenderer},
};

/// Content type of the plain-text metrics exposition.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Static dashboard assets are served below this path.
pub const DASHBOARD_ASSETS_PREFIX: &str = "/metrics-dashboard/";

/// Entry point for every inbound request. Built-in endpoints are answered
/// here, everything else goes through the proxy pipeline.
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    pipeline: RequestPipeline,
    health_checker: HealthChecker,
    renderer: Arc<dyn TemplateRenderer>,
    file_system: Arc<FileSystemAdapter>,
}

impl HttpHandler {
    pub fn new(
        gateway: Arc<GatewayService>,
        http_client: Arc<dyn HttpClient>,
        renderer: Arc<dyn TemplateRenderer>,
        file_system: Arc<FileSystemAdapter>,
    ) -> Self {
        let health_checker = HealthChecker::new(
            gateway.routes().clone(),
            http_client.clone(),
            Duration::from_millis(gateway.config().health_check.timeout_ms),
        );
        let pipeline = RequestPipeline::new(gateway.clone(), http_client);

        Self {
            gateway,
            pipeline,
            health_checker,
            renderer,
            file_system,
        }
    }

    pub async fn handle_request(&self, req: Request) -> Response<AxumBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        match path.as_str() {
            "/health" if method == Method::GET => self.handle_health_check().await,
            "/metrics" if method == Method::GET => self.handle_metrics(req.headers()).await,
            p if p.starts_with(DASHBOARD_ASSETS_PREFIX)
                && (method == Method::GET || method == Method::HEAD) =>
            {
                self.handle_dashboard_asset(req).await
            }
            _ => self.pipeline.handle(req).await,
        }
    }

    /// Always 200; per-route failures are reported inside the body.
    async fn handle_health_check(&self) -> Response<AxumBody> {
        let report = self.health_checker.check_all().await;
        json_response(StatusCode::OK, &report).unwrap_or_else(|e| {
            tracing::error!(error = ?e, "Failed to build health response");
            internal_error()
        })
    }

    async fn handle_metrics(&self, headers: &HeaderMap) -> Response<AxumBody> {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        match self.render_metrics(accept).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = ?e, "Error handling metrics request");
                internal_error()
            }
        }
    }

    async fn render_metrics(&self, accept: &str) -> Result<Response<AxumBody>> {
        let metrics = self.gateway.metrics();

        if accept.contains("text/html") {
            let html = self
                .renderer
                .render_dashboard(&metrics.document())
                .await
                .wrap_err("Failed to render metrics dashboard")?;
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .body(AxumBody::from(html))
                .wrap_err("Failed to build dashboard response")
        } else if accept.contains("application/json") {
            json_response(StatusCode::OK, &metrics.document())
        } else {
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)
                .body(AxumBody::from(metrics.exposition()))
                .wrap_err("Failed to build metrics response")
        }
    }

    async fn handle_dashboard_asset(&self, req: Request) -> Response<AxumBody> {
        let file_path = req
            .uri()
            .path()
            .strip_prefix(DASHBOARD_ASSETS_PREFIX)
            .unwrap_or_default()
            .to_owned();
        let root = &self.gateway.config().dashboard.assets_dir;

        match self.file_system.serve_file(root, &file_path, req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(path = %file_path, error = %e, "Failed to serve dashboard asset");
                plain_response(StatusCode::NOT_FOUND, "File not found")
            }
        }
    }
}

/// Build the application router around `handler`, adding the security
/// headers and CORS layers the environment asks for.
pub fn build_router(handler: Arc<HttpHandler>) -> Router {
    let config = handler.gateway.config();
    let cors = config.cors_options.clone();
    let helmet = config.security.enable_helmet;

    let make_route = |handler: Arc<HttpHandler>| {
        any(move |req: Request| {
            let handler = handler.clone();
            async move { handler.handle_request(req).await }
        })
    };

    let mut router = Router::new()
        .route("/{*path}", make_route(handler.clone()))
        .route("/", make_route(handler));

    if helmet {
        router = router.layer(middleware::from_fn(security_headers_middleware));
    }
    if let Some(cors) = cors {
        router = router.layer(middleware::from_fn(create_cors_middleware(Arc::new(cors))));
    }
    router
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<AxumBody>> {
    let body = serde_json::to_vec(value).wrap_err("Failed to serialize response body")?;
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(AxumBody::from(body))
        .wrap_err("Failed to build JSON response")
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    response
}

fn internal_error() -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(r#"{"error":"Internal Server Error"}"#));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
