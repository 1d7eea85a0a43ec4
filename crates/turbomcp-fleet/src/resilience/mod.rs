//! Resilience primitives for managed servers
//!
//! ```text
//! resilience/
//! ├── circuit_breaker.rs  # Closed / open / half-open gate per server
//! ├── isolation.rs        # Failure classification, counting and quarantine
//! └── retry.rs            # Backoff strategies and retry decisions
//! ```
//!
//! A guarded call runs retry → circuit breaker → isolator → operation, so
//! every attempt is counted by the breaker and the isolator and a tripped
//! breaker stops further retries immediately.

pub mod circuit_breaker;
pub mod isolation;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use isolation::{ErrorIsolator, ErrorStats, FailureOutcome, IsolationConfig, MIN_QUARANTINE};
pub use retry::{BackoffStrategy, RetryConfig, RetryPolicy, RetryStats};
