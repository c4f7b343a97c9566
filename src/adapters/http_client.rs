use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, Error as LegacyClientError, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::{Instant, timeout};

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult, ProbeResponse};

pub const RESPONSE_TIME_HEADER: &str = "x-response-time";

/// HTTP client adapter using Hyper with Rustls.
///
/// Responsibilities:
/// * Sets `Host` from the rewritten upstream URI
/// * Streams request and response bodies without buffering
/// * Performs `GET` health probes with timeout
///
/// Timeouts for proxied calls are owned by the circuit breaker, not here.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);

        Ok(Self { client })
    }

    /// Point `Host` at the upstream authority.
    fn set_host_header(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(host) = req.uri().host() else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        };
        let value = match req.uri().port() {
            Some(port) => format!("{host}:{}", port.as_u16()),
            None => host.to_string(),
        };
        let value = HeaderValue::from_str(&value)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::set_host_header(&mut req)?;

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();

        tracing::debug!(%method, %uri, "Sending request to backend");

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // Axum re-frames the streamed body.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::warn!(%method, %uri, error = %e, "Backend request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }

    async fn probe(&self, url: &str, probe_timeout: Duration) -> HttpClientResult<ProbeResponse> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let started = Instant::now();
        // The deadline covers the body as well as the head.
        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let response_time = response
                .headers()
                .get(RESPONSE_TIME_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let elapsed = started.elapsed();
            // Drain so the connection can be reused.
            let _ = response.into_body().collect().await;
            Ok::<_, LegacyClientError>(ProbeResponse {
                status,
                response_time,
                elapsed,
            })
        };

        match timeout(probe_timeout, exchange).await {
            Ok(Ok(probe)) => {
                tracing::debug!(url, status = %probe.status, "Health probe finished");
                Ok(probe)
            }
            Ok(Err(e)) => Err(HttpClientError::ConnectionError(format!(
                "Health probe to {url} failed: {e}"
            ))),
            Err(_) => Err(HttpClientError::Timeout(probe_timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[tokio::test]
    async fn test_host_header_follows_uri() {
        let mut req = Request::builder()
            .uri("http://backend.internal:8080/users")
            .header(header::HOST, "gateway.example.com")
            .body(AxumBody::empty())
            .unwrap();

        HttpClientAdapter::set_host_header(&mut req).unwrap();
        assert_eq!(req.headers()[header::HOST], "backend.internal:8080");
    }

    #[tokio::test]
    async fn test_probe_reports_status_and_response_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).insert_header("X-Response-Time", "12ms"))
            .mount(&server)
            .await;

        let client = HttpClientAdapter::new().unwrap();
        let probe = client
            .probe(&format!("{}/health", server.uri()), Duration::from_secs(2))
            .await
            .unwrap();

        assert!(probe.is_up());
        assert_eq!(probe.response_time.as_deref(), Some("12ms"));
    }

    #[tokio::test]
    async fn test_probe_invalid_url() {
        let client = HttpClientAdapter::new().unwrap();
        let result = client.probe("invalid-url", Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = HttpClientAdapter::new().unwrap();
        let result = client
            .probe(&server.uri(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(HttpClientError::Timeout(50))));
    }

    #[tokio::test]
    async fn test_health_request_timeout_covers_stalled_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = HttpClientAdapter::new().unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            client.probe(&format!("http://{addr}/health"), Duration::from_millis(100)),
        )
        .await
        .expect("health request must finish within its own deadline");
        assert!(matches!(result, Err(HttpClientError::Timeout(100))));
    }
}
