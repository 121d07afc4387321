//! Endpoint selection under health and quota constraints.
//!
//! - Rate ceilings per calendar minute and day
//! - Circuit breaking after consecutive failures
//! - Uniform random choice among what remains

pub mod circuit_breaker;
pub mod rate_limit;
mod selector;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot, CircuitState};
pub use rate_limit::RateLimiter;
pub use selector::{EndpointRegistry, EndpointStatus};
