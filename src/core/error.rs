//! Per-request errors and their JSON error bodies.
use std::time::Duration;

use axum::{
    body::Body as AxumBody,
    http::{HeaderValue, Response, StatusCode, header},
};
use serde::Serialize;
use thiserror::Error;

use crate::{core::context::REQUEST_ID_HEADER, ports::http_client::HttpClientError};

/// Errors that end a proxied request early. All are recoverable: they
/// become a response, never a crash.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Too many requests, please try again later.")]
    RateLimitExceeded { retry_after: Duration },

    #[error("Service temporarily unavailable, circuit for '{route}' is open")]
    CircuitOpen { route: String },

    #[error("Service unavailable. Please try again later.")]
    BackendUnavailable {
        route: String,
        #[source]
        source: HttpClientError,
    },

    #[error("Service unavailable. Backend did not answer within {}ms", .after.as_millis())]
    BackendTimeout { route: String, after: Duration },

    #[error("Route not found")]
    RouteNotFound { path: String },

    #[error("Internal Server Error")]
    Internal { detail: String },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. }
            | GatewayError::BackendUnavailable { .. }
            | GatewayError::BackendTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::BackendUnavailable { .. } | GatewayError::BackendTimeout { .. } => {
                "SERVICE_UNAVAILABLE"
            }
            GatewayError::RouteNotFound { .. } => "NOT_FOUND",
            GatewayError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// The error followed by its `source` chain, one cause per line.
    pub fn stack(&self) -> String {
        let mut stack = format!("{}: {self}", self.code());
        if let GatewayError::Internal { detail } = self {
            stack.push_str("\n    detail: ");
            stack.push_str(detail);
        }
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            stack.push_str("\n    caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }
        stack
    }

    /// JSON error response. `include_stack` adds the cause chain.
    pub fn to_response(&self, request_id: &str, include_stack: bool) -> Response<AxumBody> {
        let body = ErrorBody {
            error: ErrorPayload {
                message: self.to_string(),
                code: self.code(),
                request_id,
                stack: include_stack.then(|| self.stack()),
            },
        };
        let json = serde_json::to_vec(&body).unwrap_or_else(|_| {
            br#"{"error":{"message":"Internal Server Error","code":"INTERNAL_ERROR"}}"#.to_vec()
        });

        let mut response = Response::new(AxumBody::from(json));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        if let GatewayError::RateLimitExceeded { retry_after } = self {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorPayload<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload<'a> {
    message: String,
    code: &'static str,
    request_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use serde_json::Value;

    use super::*;

    async fn body_json(response: Response<AxumBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rate_limit_body_and_headers() {
        let err = GatewayError::RateLimitExceeded {
            retry_after: Duration::from_millis(2500),
        };
        let response = err.to_response("req-1", false);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-1");

        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(json["error"]["requestId"], "req-1");
        assert!(json["error"].get("stack").is_none());
    }

    #[tokio::test]
    async fn stack_includes_source_chain_when_requested() {
        let err = GatewayError::BackendUnavailable {
            route: "/users".to_string(),
            source: HttpClientError::ConnectionError("refused".to_string()),
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let json = body_json(err.to_response("req-2", true)).await;
        assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
        let stack = json["error"]["stack"].as_str().unwrap();
        assert!(stack.contains("caused by: Connection error: refused"));
    }

    #[test]
    fn codes_match_statuses() {
        let cases = [
            (
                GatewayError::CircuitOpen {
                    route: "/a".to_string(),
                },
                503,
                "CIRCUIT_OPEN",
            ),
            (
                GatewayError::BackendTimeout {
                    route: "/a".to_string(),
                    after: Duration::from_secs(3),
                },
                503,
                "SERVICE_UNAVAILABLE",
            ),
            (
                GatewayError::RouteNotFound {
                    path: "/x".to_string(),
                },
                404,
                "NOT_FOUND",
            ),
            (
                GatewayError::Internal {
                    detail: "boom".to_string(),
                },
                500,
                "INTERNAL_ERROR",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }
}
