//! Per-route circuit breakers.
//!
//! Each route owns one breaker, a small state machine:
//!
//! ```text
//!            failure ratio >= threshold
//!   CLOSED ------------------------------> OPEN
//!     ^                                   |  ^
//!     | trial succeeds    reset timeout   |  | trial fails / times out
//!     |                   elapsed         v  |
//!     +-------------------------------- HALF_OPEN
//! ```
//!
//! CLOSED calls feed a rolling window of time buckets. OPEN rejects
//! synchronously without touching the backend. HALF_OPEN lets exactly one
//! trial through; everything arriving while it is in flight is rejected.
//! Every dispatch runs under the route timeout and an elapsed timeout is a
//! failure. State changes are broadcast as [`BreakerEvent`]s; the breaker
//! itself performs no I/O besides the dispatch it wraps.
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{sync::broadcast, time::Instant};

use crate::{config::CircuitBreakerConfig, core::routes::RouteRegistry};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit for route '{route}' is open")]
    Open { route: String },

    #[error("call to route '{route}' timed out after {}ms", .after.as_millis())]
    Timeout { route: String, after: Duration },

    #[error("no circuit breaker registered for route '{0}'")]
    UnknownRoute(String),

    #[error("{0}")]
    Inner(E),
}

/// Breaker tuning for one route.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub timeout: Duration,
    pub error_threshold_percent: f64,
    pub minimum_volume: u32,
    pub reset_timeout: Duration,
    pub rolling_window: Duration,
    pub rolling_buckets: u32,
}

impl BreakerSettings {
    pub fn from_config(config: &CircuitBreakerConfig, timeout: Duration) -> Self {
        Self {
            timeout,
            error_threshold_percent: config.error_threshold_percentage,
            minimum_volume: config.volume_threshold,
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            rolling_window: Duration::from_millis(config.rolling_count_timeout_ms),
            rolling_buckets: config.rolling_count_buckets.max(1),
        }
    }
}

/// Outcome totals over the rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl WindowCounts {
    pub fn total(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    pub fn error_percent(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.failures + self.timeouts) as f64 * 100.0 / total as f64,
        }
    }

    fn add(&mut self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success => self.successes += 1,
            CallOutcome::Failure => self.failures += 1,
            CallOutcome::Timeout => self.timeouts += 1,
        }
    }

    fn merge(&mut self, other: &WindowCounts) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
    }
}

#[derive(Debug)]
struct RollingWindow {
    span: Duration,
    bucket_span: Duration,
    buckets: VecDeque<(Instant, WindowCounts)>,
}

impl RollingWindow {
    fn new(span: Duration, buckets: u32) -> Self {
        Self {
            span,
            bucket_span: span / buckets,
            buckets: VecDeque::with_capacity(buckets as usize),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((start, _)) = self.buckets.front() {
            if now.saturating_duration_since(*start) >= self.span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, outcome: CallOutcome, now: Instant) {
        self.prune(now);
        match self.buckets.back_mut() {
            Some((start, counts)) if now.saturating_duration_since(*start) < self.bucket_span => {
                counts.add(outcome)
            }
            _ => {
                let mut counts = WindowCounts::default();
                counts.add(outcome);
                self.buckets.push_back((now, counts));
            }
        }
    }

    fn totals(&self) -> WindowCounts {
        let mut totals = WindowCounts::default();
        for (_, counts) in &self.buckets {
            totals.merge(counts);
        }
        totals
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }
}

/// A state change, published on the manager's broadcast channel.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerEvent {
    pub route: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub counts: WindowCounts,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub route: String,
    pub state: BreakerState,
    pub counts: WindowCounts,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    route: String,
    settings: BreakerSettings,
    core: Mutex<BreakerCore>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(
        route: impl Into<String>,
        settings: BreakerSettings,
        events: broadcast::Sender<BreakerEvent>,
    ) -> Self {
        let window = RollingWindow::new(settings.rolling_window, settings.rolling_buckets);
        Self {
            route: route.into(),
            settings,
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                window,
                opened_at: None,
                trial_in_flight: false,
            }),
            events,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.lock();
        BreakerSnapshot {
            route: self.route.clone(),
            state: core.state,
            counts: core.window.totals(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `dispatch` through the breaker; any `Ok` counts as a success.
    pub async fn fire<T, E, F, Fut>(&self, dispatch: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fire_classified(dispatch, |_| true).await
    }

    /// Like [`fire`](Self::fire), but `is_success` decides whether an `Ok`
    /// value counts as a success or a failure for the window. The value is
    /// returned to the caller either way.
    pub async fn fire_classified<T, E, F, Fut, C>(
        &self,
        dispatch: F,
        is_success: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&T) -> bool,
    {
        let permit = self.try_acquire(Instant::now()).ok_or_else(|| BreakerError::Open {
            route: self.route.clone(),
        })?;

        match tokio::time::timeout(self.settings.timeout, dispatch()).await {
            Ok(Ok(value)) => {
                let outcome = if is_success(&value) {
                    CallOutcome::Success
                } else {
                    CallOutcome::Failure
                };
                permit.settle(outcome);
                Ok(value)
            }
            Ok(Err(error)) => {
                permit.settle(CallOutcome::Failure);
                Err(BreakerError::Inner(error))
            }
            Err(_) => {
                permit.settle(CallOutcome::Timeout);
                Err(BreakerError::Timeout {
                    route: self.route.clone(),
                    after: self.settings.timeout,
                })
            }
        }
    }

    /// Admission decision. `None` means reject without dispatching.
    fn try_acquire(&self, now: Instant) -> Option<Permit<'_>> {
        let mut core = self.lock();
        let trial = match core.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let elapsed = core
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed < self.settings.reset_timeout {
                    return None;
                }
                self.transition(&mut core, BreakerState::HalfOpen);
                core.trial_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if core.trial_in_flight {
                    return None;
                }
                core.trial_in_flight = true;
                true
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_outcome(&self, trial: bool, outcome: CallOutcome, now: Instant) {
        let mut core = self.lock();

        if trial {
            core.trial_in_flight = false;
            if outcome == CallOutcome::Success {
                core.window.reset();
                core.opened_at = None;
                self.transition(&mut core, BreakerState::Closed);
            } else {
                core.window.record(outcome, now);
                core.opened_at = Some(now);
                self.transition(&mut core, BreakerState::Open);
            }
            return;
        }

        core.window.record(outcome, now);
        if core.state != BreakerState::Closed {
            return;
        }

        let totals = core.window.totals();
        if totals.total() >= u64::from(self.settings.minimum_volume)
            && totals.error_percent() >= self.settings.error_threshold_percent
        {
            core.opened_at = Some(now);
            self.transition(&mut core, BreakerState::Open);
        }
    }

    /// A trial that never reported back reopens the breaker.
    fn abandon_trial(&self, now: Instant) {
        let mut core = self.lock();
        core.trial_in_flight = false;
        if core.state == BreakerState::HalfOpen {
            core.opened_at = Some(now);
            self.transition(&mut core, BreakerState::Open);
        }
    }

    fn transition(&self, core: &mut BreakerCore, to: BreakerState) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        let event = BreakerEvent {
            route: self.route.clone(),
            from,
            to,
            counts: core.window.totals(),
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Admission ticket for one call; settles the outcome exactly once.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: CallOutcome) {
        self.settled = true;
        self.breaker.on_outcome(self.trial, outcome, Instant::now());
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial(Instant::now());
        }
    }
}

/// One breaker per route, plus the shared event channel.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            breakers: HashMap::new(),
            events,
        }
    }

    pub fn from_routes(routes: &RouteRegistry, config: &CircuitBreakerConfig) -> Self {
        let mut manager = Self::new();
        for route in routes.iter() {
            manager.register(
                route.prefix(),
                BreakerSettings::from_config(config, route.timeout()),
            );
        }
        manager
    }

    pub fn register(&mut self, route: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(route, settings, self.events.clone()));
        self.breakers.insert(route.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, route: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(route)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.route.cmp(&b.route));
        snapshots
    }

    pub async fn fire<T, E, F, Fut>(&self, route: &str, dispatch: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fire_classified(route, dispatch, |_| true).await
    }

    pub async fn fire_classified<T, E, F, Fut, C>(
        &self,
        route: &str,
        dispatch: F,
        is_success: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&T) -> bool,
    {
        let breaker = self
            .breakers
            .get(route)
            .ok_or_else(|| BreakerError::UnknownRoute(route.to_string()))?;
        breaker.fire_classified(dispatch, is_success).await
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}
