use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, StatusCode};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0}ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Result of a health probe that got an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: StatusCode,
    /// Value of the backend's `X-Response-Time` header, when sent.
    pub response_time: Option<String>,
    /// Wall-clock time until the response head arrived.
    pub elapsed: Duration,
}

impl ProbeResponse {
    pub fn is_up(&self) -> bool {
        self.status.is_success()
    }
}

/// HttpClient defines the port (interface) for making HTTP requests to backends
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server.
    ///
    /// Backend error statuses are returned as ordinary responses; only
    /// transport problems are errors.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// `GET` a health endpoint, giving up after `timeout`.
    async fn probe(&self, url: &str, timeout: Duration) -> HttpClientResult<ProbeResponse>;
}
