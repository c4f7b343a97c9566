//! Core gateway state.
//!
//! `GatewayService` is the explicit context object built once at startup.
//! It aggregates the immutable configuration and routing table with the
//! runtime state shared by every request:
//! * the fixed-window rate limiter (absent when rate limiting is disabled)
//! * one circuit breaker per route
//! * the request metrics registry
//!
//! Nothing here is a process global, so tests can build as many isolated
//! gateways as they like.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};

use crate::{
    config::EnvironmentConfig,
    core::{
        circuit_breaker::{BreakerState, CircuitBreakerManager},
        rate_limiter::RateLimiter,
        routes::RouteRegistry,
    },
    metrics::GatewayMetrics,
};

/// How often expired rate-limit buckets are dropped.
pub const BUCKET_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct GatewayService {
    config: Arc<EnvironmentConfig>,
    routes: Arc<RouteRegistry>,
    rate_limiter: Option<Arc<RateLimiter>>,
    breakers: Arc<CircuitBreakerManager>,
    metrics: Arc<GatewayMetrics>,
}

impl GatewayService {
    /// Validate the configuration and build every runtime component.
    pub fn new(config: Arc<EnvironmentConfig>) -> Result<Self> {
        let routes = Arc::new(RouteRegistry::from_config(&config)?);

        let rate_limiter = config
            .security
            .enable_rate_limit
            .then(|| Arc::new(RateLimiter::from_routes(config.rate_limit, &routes)));
        if rate_limiter.is_none() {
            tracing::warn!("Rate limiting is disabled");
        }

        let breakers = Arc::new(CircuitBreakerManager::from_routes(
            &routes,
            &config.circuit_breaker,
        ));
        let metrics =
            Arc::new(GatewayMetrics::new().wrap_err("Failed to register request metrics")?);

        tracing::info!(routes = routes.len(), "Gateway service initialized");

        Ok(Self {
            config,
            routes,
            rate_limiter,
            breakers,
            metrics,
        })
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RouteRegistry> {
        &self.routes
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Start the breaker event logger and the bucket purge loop. Both stop
    /// when `shutdown` fires.
    pub fn spawn_background_tasks<S>(&self, shutdown: &broadcast::Sender<S>) -> Vec<JoinHandle<()>>
    where
        S: Clone + Send + 'static,
    {
        let mut tasks = vec![spawn_breaker_event_logger(
            &self.breakers,
            shutdown.subscribe(),
        )];
        if let Some(limiter) = &self.rate_limiter {
            tasks.push(spawn_bucket_purge(
                limiter.clone(),
                BUCKET_PURGE_INTERVAL,
                shutdown.subscribe(),
            ));
        }
        tasks
    }
}

/// Log every breaker state change.
pub fn spawn_breaker_event_logger<S>(
    breakers: &CircuitBreakerManager,
    mut shutdown: broadcast::Receiver<S>,
) -> JoinHandle<()>
where
    S: Clone + Send + 'static,
{
    let mut events = breakers.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => match event.to {
                        BreakerState::Open => tracing::warn!(
                            route = %event.route,
                            from = %event.from,
                            failures = event.counts.failures,
                            timeouts = event.counts.timeouts,
                            total = event.counts.total(),
                            "Circuit breaker opened"
                        ),
                        BreakerState::HalfOpen => tracing::info!(
                            route = %event.route,
                            "Circuit breaker half-open, letting a trial request through"
                        ),
                        BreakerState::Closed => tracing::info!(
                            route = %event.route,
                            "Circuit breaker closed"
                        ),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Breaker event logger lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    })
}

/// Periodically drop rate-limit buckets whose window has ended.
pub fn spawn_bucket_purge<S>(
    limiter: Arc<RateLimiter>,
    every: Duration,
    mut shutdown: broadcast::Receiver<S>,
) -> JoinHandle<()>
where
    S: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = limiter.purge_expired(Instant::now()).await;
                    if removed > 0 {
                        tracing::debug!(removed, remaining = limiter.tracked_buckets(), "Purged rate-limit buckets");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
