//! fgateway - a reverse-proxy API gateway with per-route protection and a
//! live metrics dashboard.
//!
//! Every configured route maps a path prefix to one backend. Requests that
//! match a route pass through a fixed pipeline:
//! 1. a fixed-window rate limiter keyed by client and route,
//! 2. a per-route circuit breaker (`CLOSED` / `OPEN` / `HALF_OPEN`),
//! 3. the backend call itself, bounded by the route timeout.
//!
//! Each request carries a correlation id (`X-Request-ID`) and produces
//! exactly one observation in the request metrics. `/metrics` serves those
//! metrics as Prometheus text, as a parsed JSON document, or as an HTML
//! dashboard; `/health` probes every backend concurrently.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use fgateway::{
//!     DashboardRenderer, FileSystemAdapter, GatewayService, HttpClientAdapter, HttpHandler,
//!     adapters::build_router, config::load_config,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(load_config("gateway.config.json", "development").await?);
//! let gateway = Arc::new(GatewayService::new(config.clone())?);
//! let handler = HttpHandler::new(
//!     gateway,
//!     Arc::new(HttpClientAdapter::new()?),
//!     Arc::new(DashboardRenderer::new(&config.dashboard.template)),
//!     Arc::new(FileSystemAdapter::new()),
//! );
//! let app = build_router(Arc::new(handler));
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Business logic lives in `core`, with no knowledge of sockets or files.
//! `ports` declares the traits `core` and the handler depend on, and
//! `adapters` implements them with hyper, tower-http and minijinja.
//!
//! # Error Handling
//! Startup paths return `eyre::Result`. Per-request failures are typed
//! (`GatewayError`) and always become a JSON error response; they never
//! abort the process.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{DashboardRenderer, FileSystemAdapter, HealthChecker, HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
