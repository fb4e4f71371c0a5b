//! # backend-orchestrator
//!
//! Resilience and orchestration core for services that call other services.
//!
//! ## Overview
//!
//! Every outbound call is wrapped in a request context, checked against a per-service token
//! bucket, routed through a per-service circuit breaker and recorded for performance analysis.
//! Deferred work goes through a priority queue with retries, deduplication and bounded
//! concurrency. A health aggregator periodically turns all of that into scores, statuses,
//! trends and alerts.
//!
//! ## Quick Start
//!
//! ```rust
//! use backend_orchestrator::{BackendManager, ExecuteOptions, ServiceConfig};
//!
//! # tokio_test::block_on(async {
//! let backend = BackendManager::default();
//! backend.register(ServiceConfig::new("users")).unwrap();
//! backend.initialize().await.unwrap();
//!
//! let name: String = backend
//!     .execute(ExecuteOptions::new("users", "lookup"), |ctx| async move {
//!         Ok(format!("served in trace {}", ctx.trace_id.len()))
//!     })
//!     .await
//!     .unwrap();
//! assert!(name.starts_with("served"));
//!
//! let status = backend.status();
//! assert_eq!(status.services[0].total_requests, 1);
//! backend.shutdown().await.unwrap();
//! # });
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`manager`] | [`BackendManager`], the single entry point |
//! | [`resilience`] | Circuit breaker coordinator and token-bucket rate limiter |
//! | [`queue`] | Priority request queue with retries and deduplication |
//! | [`context`] | Request contexts, traces and latency statistics |
//! | [`registry`] | Service registry and health checks |
//! | [`performance`] | Metric buffers and bottleneck detection |
//! | [`health`] | Health scoring, alerts and trends |
//! | [`events`] | Typed events and listener registration |
//! | [`config`] | YAML/JSON configuration |

pub mod config;
pub mod context;
pub mod error_code;
pub mod events;
pub mod health;
pub mod manager;
pub mod performance;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod utils;

pub use config::{BackendConfig, ServiceEntry};
pub use context::{RequestContext, RequestContextManager, StartOptions};
pub use error_code::{ErrorCode, FailureClass};
pub use events::{BackendEvent, EventBus, Subscription};
pub use health::{HealthAggregator, HealthReport, HealthStatus};
pub use manager::{BackendManager, BackendStatus, ExecuteOptions};
pub use queue::{EnqueueOptions, Priority, QueueManager, QueueProcessor};
pub use registry::{Criticality, ServiceConfig, ServiceRegistry};
pub use resilience::{CircuitBreakerCoordinator, CircuitState, RateLimiter};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
