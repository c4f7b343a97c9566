//! Cross-cutting Axum middleware attached around the gateway router: CORS
//! driven by `corsOptions` and hardening headers when `enableHelmet` is set.
use std::{future::Future, pin::Pin, sync::Arc};

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::Response,
};

use crate::config::CorsOptions;

const ALLOWED_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Headers set by [`security_headers_middleware`], unless the backend
/// already sent them.
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("content-security-policy", "default-src 'self'; base-uri 'self'; font-src 'self' https: data:; form-action 'self'; frame-ancestors 'self'; img-src 'self' data:; object-src 'none'; script-src 'self'; style-src 'self' https: 'unsafe-inline'; upgrade-insecure-requests"),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "same-origin"),
    ("origin-agent-cluster", "?1"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=15552000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

/// Add hardening headers without overwriting ones already present.
pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers
            .entry(*name)
            .or_insert_with(|| HeaderValue::from_static(value));
    }
    response
}

/// Apply `corsOptions`: answer preflights with 204 and decorate every other
/// response with the allowed origin, exposed headers and credentials flag.
pub async fn cors_middleware(req: Request, next: Next, cors: Arc<CorsOptions>) -> Response {
    let origin = req.headers().get(header::ORIGIN).cloned();
    let is_preflight = req.method() == Method::OPTIONS
        && req
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

    if is_preflight {
        let requested_headers = req
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned();
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        let headers = response.headers_mut();
        apply_cors_headers(headers, &cors, origin.as_ref());
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        if let Some(requested) = requested_headers {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        return response;
    }

    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut(), &cors, origin.as_ref());
    response
}

/// Cloneable closure wrapping [`cors_middleware`] for `middleware::from_fn`.
pub fn create_cors_middleware(
    cors: Arc<CorsOptions>,
) -> impl Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Clone {
    move |req, next| {
        let cors = cors.clone();
        Box::pin(async move { cors_middleware(req, next, cors).await })
    }
}

fn apply_cors_headers(headers: &mut HeaderMap, cors: &CorsOptions, origin: Option<&HeaderValue>) {
    // A wildcard cannot be combined with credentials, so the caller's origin
    // is reflected instead.
    let allow_origin = if cors.origin.is_wildcard() && !cors.credentials {
        Some(HeaderValue::from_static("*"))
    } else {
        origin
            .filter(|o| o.to_str().is_ok_and(|o| cors.origin.allows(o)))
            .cloned()
    };

    let Some(allow_origin) = allow_origin else {
        return;
    };
    if allow_origin != "*" {
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);

    if cors.credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    if !cors.exposed_headers.is_empty()
        && let Ok(exposed) = HeaderValue::from_str(&cors.exposed_headers.join(","))
    {
        headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, exposed);
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::config::CorsOrigin;

    fn app(cors: CorsOptions) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(middleware::from_fn(create_cors_middleware(Arc::new(cors))))
    }

    fn request(method: Method, origin: &str) -> Request {
        Request::builder()
            .method(method)
            .uri("/")
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_wildcard_origin_with_exposed_headers() {
        let cors = CorsOptions {
            exposed_headers: vec!["X-Request-ID".to_string(), "RateLimit-Remaining".to_string()],
            ..Default::default()
        };
        let response = app(cors)
            .oneshot(request(Method::GET, "https://app.example"))
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(
            headers[header::ACCESS_CONTROL_EXPOSE_HEADERS],
            "X-Request-ID,RateLimit-Remaining"
        );
        assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_CREDENTIALS));
    }

    #[tokio::test]
    async fn test_listed_origin_is_reflected_with_credentials() {
        let cors = CorsOptions {
            origin: CorsOrigin::Many(vec!["https://app.example".to_string()]),
            credentials: true,
            ..Default::default()
        };
        let response = app(cors.clone())
            .oneshot(request(Method::GET, "https://app.example"))
            .await
            .unwrap();
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::VARY], "Origin");

        let response = app(cors)
            .oneshot(request(Method::GET, "https://evil.example"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let mut req = request(Method::OPTIONS, "https://app.example");
        req.headers_mut().insert(
            header::ACCESS_CONTROL_REQUEST_METHOD,
            HeaderValue::from_static("POST"),
        );
        req.headers_mut().insert(
            header::ACCESS_CONTROL_REQUEST_HEADERS,
            HeaderValue::from_static("content-type"),
        );

        let response = app(CorsOptions::default()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOWED_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "content-type");
    }

    #[tokio::test]
    async fn test_security_headers_keep_existing_values() {
        let app = Router::new()
            .route(
                "/",
                get(|| async { ([(header::X_FRAME_OPTIONS, "DENY")], "ok") }),
            )
            .layer(middleware::from_fn(security_headers_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let headers = response.headers();

        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["referrer-policy"], "no-referrer");
        assert!(headers.contains_key(header::STRICT_TRANSPORT_SECURITY));
    }
}
