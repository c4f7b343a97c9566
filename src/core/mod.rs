pub mod circuit_breaker;
pub mod context;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod rate_limiter;
pub mod routes;

pub use circuit_breaker::{BreakerError, BreakerState, CircuitBreaker, CircuitBreakerManager};
pub use context::RequestContext;
pub use error::GatewayError;
pub use gateway::GatewayService;
pub use pipeline::RequestPipeline;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use routes::{Route, RouteRegistry};
