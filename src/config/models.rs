//! Configuration data structures for the gateway.
//!
//! A configuration file holds one [`EnvironmentConfig`] per environment name
//! (`development`, `production`, ...). Field names are camelCase; the longer
//! `timeoutMs` / `healthCheckPath` / `rateLimitOverride` spellings are accepted
//! as aliases. Required fields are modeled as `Option` so that the validator
//! can report every missing one at once instead of failing on the first.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Whole configuration file: environment name -> settings.
pub type GatewayConfig = BTreeMap<String, EnvironmentConfig>;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_true() -> bool {
    true
}

/// Settings for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub cors_options: Option<CorsOptions>,
    /// Global rate limit applied to routes without their own override.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Default backend timeout in milliseconds.
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout: u64,
    #[serde(default)]
    pub routes: Option<Vec<RouteConfig>>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            port: None,
            cors_options: None,
            rate_limit: RateLimitConfig::default(),
            timeout: default_timeout_ms(),
            routes: None,
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

impl EnvironmentConfig {
    pub fn routes(&self) -> &[RouteConfig] {
        self.routes.as_deref().unwrap_or_default()
    }
}

/// A single proxied route as written in the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    /// Backend timeout in milliseconds, overriding the environment default.
    #[serde(default, alias = "timeoutMs")]
    pub timeout: Option<u64>,
    #[serde(default = "default_health_check_path", alias = "healthCheckPath")]
    pub health_check: String,
    #[serde(default, alias = "rateLimitOverride")]
    pub rate_limit: Option<RateLimitConfig>,
    /// Replacement for the matched prefix in the upstream path. Defaults to
    /// the prefix itself, so the full inbound path is forwarded.
    #[serde(default)]
    pub prefix_rewrite: Option<String>,
}

/// Fixed-window rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 15 * 60 * 1000,
            max: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsOptions {
    /// Allowed origins; `*` allows any.
    #[serde(default = "default_cors_origin")]
    pub origin: CorsOrigin,
    #[serde(default)]
    pub exposed_headers: Vec<String>,
    #[serde(default)]
    pub credentials: bool,
}

fn default_cors_origin() -> CorsOrigin {
    CorsOrigin::One("*".to_string())
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            origin: default_cors_origin(),
            exposed_headers: Vec::new(),
            credentials: false,
        }
    }
}

/// `origin` may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    One(String),
    Many(Vec<String>),
}

impl CorsOrigin {
    pub fn allows(&self, origin: &str) -> bool {
        match self {
            CorsOrigin::One(o) => o == "*" || o == origin,
            CorsOrigin::Many(list) => list.iter().any(|o| o == "*" || o == origin),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        match self {
            CorsOrigin::One(o) => o == "*",
            CorsOrigin::Many(list) => list.iter().any(|o| o == "*"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Error bodies carry the error chain as `stack` at debug verbosity.
    pub fn is_debug(&self) -> bool {
        matches!(self.level.to_ascii_lowercase().as_str(), "debug" | "trace")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Emit hardening response headers.
    #[serde(default = "default_true")]
    pub enable_helmet: bool,
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
    /// Trust `X-Forwarded-For` when resolving the client address.
    #[serde(default = "default_true")]
    pub trust_proxy: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_helmet: true,
            enable_rate_limit: true,
            trust_proxy: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100) at which the breaker opens.
    pub error_threshold_percentage: f64,
    /// Outcomes required in the rolling window before the breaker may open.
    pub volume_threshold: u32,
    /// Time spent OPEN before a trial call is let through.
    #[serde(alias = "resetTimeout")]
    pub reset_timeout_ms: u64,
    #[serde(alias = "rollingCountTimeout")]
    pub rolling_count_timeout_ms: u64,
    pub rolling_count_buckets: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50.0,
            volume_threshold: 0,
            reset_timeout_ms: 30_000,
            rolling_count_timeout_ms: 10_000,
            rolling_count_buckets: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    /// Per-probe timeout.
    #[serde(alias = "timeout")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardConfig {
    /// Directory served under `/metrics-dashboard/`.
    pub assets_dir: String,
    /// Template rendered for `Accept: text/html` on `/metrics`.
    pub template: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            assets_dir: "public/metrics-dashboard".to_string(),
            template: "public/metrics-dashboard/template.html".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_accepts_long_field_aliases() {
        let route: RouteConfig = serde_json::from_str(
            r#"{
                "prefix": "/users",
                "target": "http://localhost:3001",
                "timeoutMs": 2500,
                "healthCheckPath": "/status",
                "rateLimitOverride": {"windowMs": 1000, "max": 5}
            }"#,
        )
        .unwrap();

        assert_eq!(route.timeout, Some(2500));
        assert_eq!(route.health_check, "/status");
        assert_eq!(
            route.rate_limit,
            Some(RateLimitConfig {
                window_ms: 1000,
                max: 5
            })
        );
    }

    #[test]
    fn environment_defaults_fill_optional_sections() {
        let env: EnvironmentConfig =
            serde_json::from_str(r#"{"port": 8080, "routes": []}"#).unwrap();

        assert_eq!(env.timeout, 30_000);
        assert_eq!(env.rate_limit, RateLimitConfig::default());
        assert_eq!(env.logging.format, LogFormat::Json);
        assert!(env.security.enable_rate_limit);
        assert_eq!(env.circuit_breaker.reset_timeout_ms, 30_000);
        assert!(env.cors_options.is_none());
    }

    #[test]
    fn cors_origin_accepts_string_or_list() {
        let one: CorsOptions = serde_json::from_str(r#"{"origin": "https://a.test"}"#).unwrap();
        assert!(one.origin.allows("https://a.test"));
        assert!(!one.origin.allows("https://b.test"));

        let many: CorsOptions =
            serde_json::from_str(r#"{"origin": ["https://a.test", "https://b.test"]}"#).unwrap();
        assert!(many.origin.allows("https://b.test"));
        assert!(!many.origin.is_wildcard());
    }

    #[test]
    fn debug_level_enables_stack_traces() {
        let mut logging = LoggingConfig::default();
        assert!(!logging.is_debug());
        logging.level = "DEBUG".to_string();
        assert!(logging.is_debug());
    }

    #[test]
    fn breaker_and_probe_timeouts_accept_short_names() {
        let env: EnvironmentConfig = serde_json::from_str(
            r#"{
                "circuitBreaker": { "resetTimeout": 1000, "rollingCountTimeout": 2000, "volumeThreshold": 4 },
                "healthCheck": { "timeout": 750 }
            }"#,
        )
        .unwrap();

        assert_eq!(env.circuit_breaker.reset_timeout_ms, 1_000);
        assert_eq!(env.circuit_breaker.rolling_count_timeout_ms, 2_000);
        assert_eq!(env.circuit_breaker.volume_threshold, 4);
        assert_eq!(env.circuit_breaker.rolling_count_buckets, 10);
        assert_eq!(env.health_check.timeout_ms, 750);
    }
}
