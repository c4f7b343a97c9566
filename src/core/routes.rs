//! Immutable routing table built once from configuration.
use std::{sync::Arc, time::Duration};

use crate::config::{ConfigError, EnvironmentConfig, RouteConfig, ServerConfigValidator};
use crate::core::rate_limiter::RateLimitPolicy;

/// A validated route: prefix mapped to one backend target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    prefix: String,
    target: String,
    timeout: Duration,
    health_check_path: String,
    rate_limit: Option<RateLimitPolicy>,
    prefix_rewrite: String,
}

impl Route {
    fn from_config(index: usize, config: &RouteConfig, default_timeout_ms: u64) -> Result<Self, ConfigError> {
        let (Some(prefix), Some(target)) = (&config.prefix, &config.target) else {
            return Err(ConfigError::IncompleteRoute { index });
        };

        Ok(Self {
            prefix: prefix.clone(),
            target: target.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout.unwrap_or(default_timeout_ms)),
            health_check_path: config.health_check.clone(),
            rate_limit: config.rate_limit.map(RateLimitPolicy::from),
            prefix_rewrite: config.prefix_rewrite.clone().unwrap_or_else(|| prefix.clone()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn health_check_path(&self) -> &str {
        &self.health_check_path
    }

    pub fn rate_limit(&self) -> Option<RateLimitPolicy> {
        self.rate_limit
    }

    /// The prefix must end on a path segment boundary: `/users` matches
    /// `/users` and `/users/7` but not `/usersettings`.
    pub fn matches(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix.as_str()).is_some_and(|rest| {
            rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/')
        })
    }

    /// Upstream URL for an inbound path (with optional query).
    ///
    /// The matched prefix is replaced by the route's rewrite, which is the
    /// prefix itself unless configured otherwise.
    pub fn upstream_url(&self, path_and_query: &str) -> String {
        let rest = path_and_query
            .strip_prefix(self.prefix.as_str())
            .unwrap_or(path_and_query);
        let mut path = format!("{}{}", self.prefix_rewrite, rest);
        if !path.starts_with('/') && !path.starts_with('?') && !path.is_empty() {
            path.insert(0, '/');
        }
        format!("{}{}", self.target, path)
    }

    pub fn health_check_url(&self) -> String {
        format!("{}{}", self.target, self.health_check_path)
    }
}

/// Routing table. Prefixes are unique; lookup picks the longest match.
#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Vec<Arc<Route>>,
}

impl RouteRegistry {
    /// Validate the configuration and build the table in declaration order.
    pub fn from_config(config: &EnvironmentConfig) -> Result<Self, ConfigError> {
        ServerConfigValidator::validate(config)?;

        let routes = config
            .routes()
            .iter()
            .enumerate()
            .map(|(index, route)| Route::from_config(index, route, config.timeout).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { routes })
    }

    /// Longest-prefix match against the request path.
    pub fn find_matching_route(&self, path: &str) -> Option<&Arc<Route>> {
        self.routes
            .iter()
            .filter(|route| route.matches(path))
            .max_by_key(|route| route.prefix.len())
    }

    pub fn get(&self, prefix: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|route| route.prefix == prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
