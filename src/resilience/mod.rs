//! Resilience primitives: per-service circuit breakers and token-bucket rate limiting.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-service closed/open/half-open state machine with timeouts and fallbacks |
//! | [`rate_limiter`] | Per-service token buckets refilled from elapsed time |
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use backend_orchestrator::resilience::circuit_breaker::{
//!     CircuitBreakerConfig, CircuitBreakerCoordinator, CircuitState,
//! };
//! use backend_orchestrator::Error;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let breakers = CircuitBreakerCoordinator::default();
//! breakers
//!     .configure(
//!         "payments",
//!         CircuitBreakerConfig::new()
//!             .with_failure_threshold(1)
//!             .with_reset_timeout(Duration::from_secs(30)),
//!     )
//!     .unwrap();
//!
//! let failed: Result<u32, Error> = breakers
//!     .execute("payments", "charge", || async { Err(Error::transient("503")) }, None)
//!     .await;
//! assert!(failed.is_err());
//! assert_eq!(breakers.state("payments"), Some(CircuitState::Open));
//! # });
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use backend_orchestrator::resilience::rate_limiter::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new();
//! limiter
//!     .configure("search", RateLimitConfig::new().with_max_tokens(100).with_refill_rate(10.0))
//!     .unwrap();
//!
//! if limiter.try_consume("search", 1).is_allowed() {
//!     // Proceed with request...
//! }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    fallback_fn, CallStatistics, CircuitBreakerConfig, CircuitBreakerCoordinator, CircuitSnapshot,
    CircuitState, Fallback,
};
pub use rate_limiter::{RateLimitConfig, RateLimitDecision, RateLimitSnapshot, RateLimiter};
