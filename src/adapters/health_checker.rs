use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::Serialize;

use crate::{
    core::routes::{Route, RouteRegistry},
    ports::http_client::HttpClient,
};

/// Status of one route's backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Up,
    Down,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: String,
    pub services: BTreeMap<String, ServiceHealth>,
}

/// Probes every route's health endpoint on demand.
pub struct HealthChecker {
    routes: Arc<RouteRegistry>,
    http_client: Arc<dyn HttpClient>,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        routes: Arc<RouteRegistry>,
        http_client: Arc<dyn HttpClient>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            http_client,
            probe_timeout,
        }
    }

    /// Probe all routes concurrently. Every probe resolves on its own, so a
    /// slow or failing backend only affects its own entry.
    pub async fn check_all(&self) -> HealthReport {
        let probes = self.routes.iter().map(|route| async move {
            (route.prefix().to_string(), self.check_route(route).await)
        });
        let services = join_all(probes).await.into_iter().collect();

        HealthReport {
            status: "ok",
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            services,
        }
    }

    async fn check_route(&self, route: &Route) -> ServiceHealth {
        let url = route.health_check_url();
        match self.http_client.probe(&url, self.probe_timeout).await {
            Ok(probe) => {
                let status = if probe.is_up() {
                    ServiceStatus::Up
                } else {
                    tracing::warn!(route = route.prefix(), %url, status = %probe.status, "Health probe returned non-success status");
                    ServiceStatus::Down
                };
                ServiceHealth {
                    status,
                    response_time: Some(
                        probe
                            .response_time
                            .unwrap_or_else(|| format!("{}ms", probe.elapsed.as_millis())),
                    ),
                    error: None,
                }
            }
            Err(err) => {
                tracing::warn!(route = route.prefix(), %url, error = %err, "Health probe failed");
                ServiceHealth {
                    status: ServiceStatus::Down,
                    response_time: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
