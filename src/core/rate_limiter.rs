//! Fixed-window rate limiting keyed by client and scope.
//!
//! Every `(client_key, scope)` pair owns one bucket. The scope is the route
//! prefix when that route carries its own limit, otherwise the shared
//! [`GLOBAL_SCOPE`] sentinel governed by the global policy. Buckets live in a
//! concurrent `scc::HashMap`; each check runs under the entry lock so the
//! window reset and the increment happen as one step.
use std::{collections::HashMap, net::SocketAddr, time::Duration};

use axum::extract::ConnectInfo;
use http::{HeaderMap, HeaderValue, Request};
use tokio::time::Instant;

use crate::{config::RateLimitConfig, core::routes::RouteRegistry};

/// Scope shared by every route without its own limit. Route prefixes always
/// start with `/`, so this cannot collide with one.
pub const GLOBAL_SCOPE: &str = "__global__";

/// Fallback key when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

pub const RATE_LIMIT_LIMIT: &str = "ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "ratelimit-reset";

/// `max` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max: u32,
    pub window: Duration,
}

impl From<RateLimitConfig> for RateLimitPolicy {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            max: config.max,
            window: Duration::from_millis(config.window_ms),
        }
    }
}

/// Outcome of one check, with the metadata attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    /// Whole seconds until reset, rounded up.
    pub fn reset_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        if self.reset_after.subsec_nanos() > 0 { secs + 1 } else { secs }
    }

    /// Write `RateLimit-Limit`, `RateLimit-Remaining` and `RateLimit-Reset`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATE_LIMIT_RESET, HeaderValue::from(self.reset_after_secs()));
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    window_start: Instant,
    count: u32,
    policy: RateLimitPolicy,
}

impl Bucket {
    fn new(now: Instant, policy: RateLimitPolicy) -> Self {
        Self {
            window_start: now,
            count: 0,
            policy,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.policy.window
    }

    fn hit(&mut self, now: Instant) -> RateLimitDecision {
        if self.is_expired(now) {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);

        let elapsed = now.saturating_duration_since(self.window_start);
        RateLimitDecision {
            allowed: self.count <= self.policy.max,
            limit: self.policy.max,
            remaining: self.policy.max.saturating_sub(self.count),
            reset_after: self.policy.window.saturating_sub(elapsed),
        }
    }
}

/// Fixed-window limiter covering the global policy and per-route overrides.
pub struct RateLimiter {
    global: RateLimitPolicy,
    overrides: HashMap<String, RateLimitPolicy>,
    buckets: scc::HashMap<(String, String), Bucket>,
}

impl RateLimiter {
    pub fn new(global: RateLimitPolicy, overrides: HashMap<String, RateLimitPolicy>) -> Self {
        tracing::info!(
            max = global.max,
            window_ms = global.window.as_millis() as u64,
            overrides = overrides.len(),
            "Creating rate limiter"
        );
        Self {
            global,
            overrides,
            buckets: scc::HashMap::new(),
        }
    }

    /// Build from the global limit plus every route's override.
    pub fn from_routes(global: RateLimitConfig, routes: &RouteRegistry) -> Self {
        let overrides = routes
            .iter()
            .filter_map(|route| route.rate_limit().map(|p| (route.prefix().to_string(), p)))
            .collect();
        Self::new(global.into(), overrides)
    }

    fn scope_for<'a>(&self, route: &'a str) -> (&'a str, RateLimitPolicy) {
        match self.overrides.get(route) {
            Some(policy) => (route, *policy),
            None => (GLOBAL_SCOPE, self.global),
        }
    }

    /// Count one request from `client_key` against `route`.
    pub async fn check(&self, client_key: &str, route: &str) -> RateLimitDecision {
        self.check_at(client_key, route, Instant::now()).await
    }

    pub async fn check_at(&self, client_key: &str, route: &str, now: Instant) -> RateLimitDecision {
        let (scope, policy) = self.scope_for(route);
        let key = (client_key.to_string(), scope.to_string());

        let mut entry = self
            .buckets
            .entry_async(key)
            .await
            .or_insert_with(|| Bucket::new(now, policy));
        let decision = entry.get_mut().hit(now);

        if !decision.allowed {
            tracing::debug!(client = client_key, scope, "Rate limit exceeded");
        }
        decision
    }

    /// Drop buckets whose window has ended. Returns how many were removed.
    pub async fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.buckets
            .retain_async(|_, bucket| {
                let keep = !bucket.is_expired(now);
                if !keep {
                    removed += 1;
                }
                keep
            })
            .await;
        removed
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.len()
    }
}

/// Resolve the rate-limit key for a request.
///
/// Order: first `X-Forwarded-For` entry (when proxies are trusted), the peer
/// address from the connection, `X-Real-IP`, then [`UNKNOWN_CLIENT`].
pub fn client_key<T>(req: &Request<T>, trust_proxy: bool) -> String {
    let headers = req.headers();

    let forwarded = trust_proxy
        .then(|| header_str(headers, "x-forwarded-for"))
        .flatten()
        .and_then(|value| value.split(',').map(str::trim).find(|ip| !ip.is_empty()));
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    header_str(headers, "x-real-ip")
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
