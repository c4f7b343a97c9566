//! Per-request correlation state.
use http::{Method, Request};
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::rate_limiter::client_key;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Immutable facts about one in-flight request, threaded through the
/// pipeline stages. Never shared between requests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub matched_route: Option<String>,
    pub method: Method,
    pub url: String,
    pub client_ip: String,
    pub start_time: Instant,
}

impl RequestContext {
    /// Capture the context at arrival. The request id is taken from
    /// `X-Request-ID` when the caller sent a usable one.
    pub fn from_request<B>(req: &Request<B>, trust_proxy: bool) -> Self {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let url = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());

        Self {
            request_id,
            matched_route: None,
            method: req.method().clone(),
            url,
            client_ip: client_key(req, trust_proxy),
            start_time: Instant::now(),
        }
    }

    pub fn with_route(self, prefix: &str) -> Self {
        Self {
            matched_route: Some(prefix.to_string()),
            ..self
        }
    }
}
