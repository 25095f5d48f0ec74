//! 韧性层：重试退避、熔断、单次超时，以及组合三者的 ResilienceGovernor

pub mod circuit;
pub mod governor;
pub mod retry;
pub mod timeout;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitGuard, CircuitSnapshot, CircuitState, Permit,
};
pub use governor::{govern, ResilienceGovernor};
pub use retry::{RetryPolicy, RetryPredicate, MAX_JITTER_RATIO};
pub use timeout::with_timeout;
