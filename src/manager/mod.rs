//! The orchestrator entry point.
//!
//! [`BackendManager`] owns every component and routes calls through them in a fixed order:
//! request context, rate limiter, circuit breaker, then metrics recording.
//!
//! ```rust
//! use backend_orchestrator::config::{BackendConfig, ServiceEntry};
//! use backend_orchestrator::manager::{BackendManager, ExecuteOptions};
//!
//! # tokio_test::block_on(async {
//! let mut config = BackendConfig::default();
//! config.services.push(ServiceEntry::new("inventory"));
//! let backend = BackendManager::new(config).unwrap();
//! backend.initialize().await.unwrap();
//!
//! let stock: u32 = backend
//!     .execute(ExecuteOptions::new("inventory", "count"), |_ctx| async { Ok(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(stock, 42);
//!
//! backend.shutdown().await.unwrap();
//! # });
//! ```

use crate::config::BackendConfig;
use crate::context::{ContextStats, RequestContext, RequestContextManager, StartOptions};
use crate::events::{BackendEvent, RejectionReason, Subscription};
use crate::health::{HealthAggregator, HealthReport, HealthStatus};
use crate::performance::{PerformanceAnalyzer, PerformanceReport};
use crate::queue::{
    EnqueueOptions, QueueConfig, QueueItem, QueueJob, QueueManager, QueueProcessor, QueueStats,
};
use crate::registry::{ServiceConfig, ServiceDescriptor, ServiceRegistry};
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerCoordinator, CircuitSnapshot, Fallback, RateLimitConfig,
    RateLimitDecision, RateLimitSnapshot, RateLimiter,
};
use crate::utils::lock;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Input to [`BackendManager::execute`] and [`BackendManager::execute_queued`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub service: String,
    pub operation: String,
    pub parent_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Handed to the service's fallback when the call is refused.
    pub fallback_args: Option<Value>,
    /// Tokens taken from the service's bucket.
    pub tokens: u32,
    pub skip_rate_limit: bool,
}

impl ExecuteOptions {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            parent_id: None,
            metadata: BTreeMap::new(),
            fallback_args: None,
            tokens: 1,
            skip_rate_limit: false,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_fallback_args(mut self, args: Value) -> Self {
        self.fallback_args = Some(args);
        self
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.skip_rate_limit = true;
        self
    }

    fn start_options(&self) -> StartOptions {
        StartOptions {
            service: self.service.clone(),
            operation: self.operation.clone(),
            parent_id: self.parent_id.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Serializable snapshot of every component.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub initialized: bool,
    pub uptime_ms: u64,
    pub overall_health: HealthStatus,
    pub overall_score: f64,
    pub services: Vec<ServiceDescriptor>,
    pub circuits: Vec<CircuitSnapshot>,
    pub rate_limits: Vec<RateLimitSnapshot>,
    pub queues: QueueStats,
    pub requests: ContextStats,
}

/// The route every call takes: context, optional rate limit, circuit, metrics.
#[derive(Clone)]
struct CallPath {
    registry: Arc<ServiceRegistry>,
    limiter: Arc<RateLimiter>,
    circuits: Arc<CircuitBreakerCoordinator>,
    contexts: Arc<RequestContextManager>,
    analyzer: Arc<PerformanceAnalyzer>,
    enforce_rate_limits: bool,
}

impl CallPath {
    async fn call<T, F, Fut>(&self, options: ExecuteOptions, f: F) -> Result<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DeserializeOwned,
    {
        let start = options.start_options();
        self.contexts
            .with_context(start, |ctx| self.guarded(options, ctx, f))
            .await
    }

    async fn guarded<T, F, Fut>(
        &self,
        options: ExecuteOptions,
        ctx: RequestContext,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DeserializeOwned,
    {
        let service = options.service.as_str();
        let operation = options.operation.as_str();
        if self.enforce_rate_limits && !options.skip_rate_limit {
            if let RateLimitDecision::Denied { retry_after } =
                self.limiter.try_consume(service, options.tokens)
            {
                let err = Error::RateLimited {
                    service: service.to_string(),
                    retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
                };
                return self
                    .circuits
                    .reject(service, RejectionReason::RateLimited, options.fallback_args, err)
                    .await;
            }
        }

        // Only calls that reached the wrapped function count toward service metrics.
        let invoked = AtomicBool::new(false);
        let started = Instant::now();
        let result = self
            .circuits
            .execute(
                service,
                operation,
                || {
                    invoked.store(true, Ordering::Relaxed);
                    f(ctx)
                },
                options.fallback_args,
            )
            .await;
        if invoked.load(Ordering::Relaxed) {
            let elapsed = started.elapsed();
            self.registry
                .record_request(service, result.is_ok(), elapsed);
            self.analyzer
                .record_request(service, operation, elapsed, result.is_ok());
        }
        result
    }
}

/// Runs queued items through the same call path as [`BackendManager::execute`].
struct ManagedProcessor {
    inner: Arc<dyn QueueProcessor>,
    path: CallPath,
}

#[async_trait]
impl QueueProcessor for ManagedProcessor {
    async fn process(&self, item: QueueItem) -> Result<Value> {
        let options = ExecuteOptions {
            fallback_args: Some(item.payload.clone()),
            ..ExecuteOptions::new(&item.service, &item.operation)
                .with_metadata("queue_item_id", &item.id)
                .with_metadata("retry", item.retry_count.to_string())
                .without_rate_limit()
        };
        let inner = Arc::clone(&self.inner);
        self.path
            .call(options, move |_ctx| async move { inner.process(item).await })
            .await
    }
}

pub struct BackendManager {
    config: BackendConfig,
    registry: Arc<ServiceRegistry>,
    limiter: Arc<RateLimiter>,
    circuits: Arc<CircuitBreakerCoordinator>,
    contexts: Arc<RequestContextManager>,
    queue: Arc<QueueManager>,
    analyzer: Arc<PerformanceAnalyzer>,
    health: Arc<HealthAggregator>,
    path: CallPath,
    initialized: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    started_at: Mutex<Option<Instant>>,
}

impl BackendManager {
    /// Validates `config`, builds every component and registers the configured services.
    pub fn new(config: BackendConfig) -> Result<Self> {
        config.validate()?;
        for warning in config.warnings() {
            warn!(warning = %warning, "configuration warning");
        }
        let manager = Self::build(config);
        for entry in manager.config.services.clone() {
            manager.registry.register(entry.service_config())?;
            if let Some(c) = entry.circuit {
                manager.circuits.configure(&entry.name, c)?;
            }
            if let Some(r) = entry.rate_limit {
                manager.limiter.configure(&entry.name, r)?;
            }
            if let Some(q) = entry.queue {
                manager.queue.configure(&entry.name, q)?;
            }
        }
        Ok(manager)
    }

    /// Loads, validates and applies a YAML or JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(BackendConfig::from_file(path)?)
    }

    fn build(config: BackendConfig) -> Self {
        let registry = Arc::new(ServiceRegistry::new(config.health.check_timeout));
        let limiter = Arc::new(match &config.rate_limit {
            Some(default) => RateLimiter::with_default(default.clone()),
            None => RateLimiter::new(),
        });
        let circuits = Arc::new(CircuitBreakerCoordinator::new(config.circuit_breaker.clone()));
        let contexts = Arc::new(RequestContextManager::new(config.context.clone()));
        let queue = Arc::new(QueueManager::new(config.queue.clone()));
        let analyzer = Arc::new(PerformanceAnalyzer::new(config.analyzer.clone()));
        let health = Arc::new(HealthAggregator::new(
            config.health.clone(),
            Arc::clone(&registry),
            Arc::clone(&analyzer),
            Arc::clone(&circuits),
            Arc::clone(&limiter),
        ));
        let path = CallPath {
            registry: Arc::clone(&registry),
            limiter: Arc::clone(&limiter),
            circuits: Arc::clone(&circuits),
            contexts: Arc::clone(&contexts),
            analyzer: Arc::clone(&analyzer),
            enforce_rate_limits: config.enforce_rate_limits,
        };
        Self {
            config,
            registry,
            limiter,
            circuits,
            contexts,
            queue,
            analyzer,
            health,
            path,
            initialized: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            started_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Starts the background loops and publishes a first health report. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_initialized() {
            debug!("backend manager already initialized");
            return Ok(());
        }
        self.contexts.start()?;
        if let Err(e) = self.queue.start() {
            self.contexts.stop().await;
            return Err(e);
        }
        if let Err(e) = self.health.start() {
            self.queue.stop().await;
            self.contexts.stop().await;
            return Err(e);
        }
        self.health.evaluate().await;
        *lock(&self.started_at) = Some(Instant::now());
        self.initialized.store(true, Ordering::SeqCst);
        info!(services = self.registry.len(), "backend manager initialized");
        Ok(())
    }

    /// Stops the loops after giving queued work `drain_timeout` to finish. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_initialized() {
            debug!("backend manager not running");
            return Ok(());
        }
        self.health.stop().await;
        self.queue.stop().await;
        if !self.queue.drain(self.config.drain_timeout).await {
            warn!(
                drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
                "shutdown continuing with queued work outstanding"
            );
        }
        self.contexts.stop().await;
        *lock(&self.started_at) = None;
        self.initialized.store(false, Ordering::SeqCst);
        info!("backend manager shut down");
        Ok(())
    }

    pub fn register(&self, config: ServiceConfig) -> Result<()> {
        self.registry.register(config)
    }

    /// Removes the service and every per-service record kept for it.
    pub fn unregister(&self, service: &str) -> bool {
        let removed = self.registry.unregister(service);
        self.circuits.remove(service);
        self.limiter.remove(service);
        self.queue.remove_processor(service);
        self.analyzer.reset(service);
        removed
    }

    pub fn configure_circuit(&self, service: &str, config: CircuitBreakerConfig) -> Result<()> {
        self.circuits.configure(service, config)
    }

    pub fn configure_rate_limit(&self, service: &str, config: RateLimitConfig) -> Result<()> {
        self.limiter.configure(service, config)
    }

    pub fn configure_queue(&self, service: &str, config: QueueConfig) -> Result<()> {
        self.queue.configure(service, config)
    }

    pub fn register_fallback(&self, service: &str, fallback: Arc<dyn Fallback>) {
        self.circuits.register_fallback(service, fallback);
    }

    /// Installs a queue processor. Queued items run through context tracking, the circuit
    /// breaker and metrics, but not the rate limiter.
    pub fn register_processor(&self, service: &str, processor: Arc<dyn QueueProcessor>) {
        let managed = ManagedProcessor {
            inner: processor,
            path: self.path.clone(),
        };
        self.queue.register_processor(service, Arc::new(managed));
    }

    /// Runs `f` for `options.service` under the rate limiter and circuit breaker, inside a
    /// request context.
    pub async fn execute<T, F, Fut>(&self, options: ExecuteOptions, f: F) -> Result<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DeserializeOwned,
    {
        self.path.call(options, f).await
    }

    /// Like [`execute`](Self::execute), but the call waits its turn in the service's queue
    /// under `queue` priority and capacity. Fails with `QueueOverflow` when the queue is full.
    ///
    /// Dispatch happens on the queue's background loop, so the manager must be initialized
    /// (or the queue drained) for the call to run. Giving up after `wait_timeout` leaves the
    /// queued call running.
    pub async fn execute_queued<T, F, Fut>(
        &self,
        options: ExecuteOptions,
        queue: EnqueueOptions,
        wait_timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let service = options.service.clone();
        let operation = options.operation.clone();
        let payload = options.fallback_args.clone().unwrap_or(Value::Null);
        let path = self.path.clone();
        let job: QueueJob = Box::new(move |_item: QueueItem| {
            async move {
                let value: T = path.call(options, f).await?;
                Ok::<Value, Error>(serde_json::to_value(value)?)
            }
            .boxed()
        });
        let id = self
            .queue
            .enqueue_job(&service, &operation, payload, queue, job)?;
        let item = self.queue.wait_for_completion(&id, wait_timeout).await?;
        Ok(serde_json::from_value(item.result.unwrap_or(Value::Null))?)
    }

    pub fn enqueue(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        self.queue.enqueue(service, operation, payload, options)
    }

    pub async fn enqueue_and_wait<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: EnqueueOptions,
        wait_timeout: Duration,
    ) -> Result<T> {
        self.queue
            .enqueue_and_wait(service, operation, payload, options, wait_timeout)
            .await
    }

    /// Listens to circuit, request and health events through one subscription.
    pub fn subscribe<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(&BackendEvent) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let mut subs = Vec::with_capacity(3);
        for bus in [
            self.circuits.events(),
            self.contexts.events(),
            self.health.events(),
        ] {
            let l = Arc::clone(&listener);
            match bus.subscribe(move |e: &BackendEvent| (*l)(e)) {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    Subscription::merge(subs).unsubscribe();
                    return Err(e);
                }
            }
        }
        Ok(Subscription::merge(subs))
    }

    pub fn status(&self) -> BackendStatus {
        let health = self.health.latest();
        BackendStatus {
            initialized: self.is_initialized(),
            uptime_ms: lock(&self.started_at)
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0),
            overall_health: health.overall_status,
            overall_score: health.overall_score,
            services: self.registry.list(),
            circuits: self.circuits.snapshots(),
            rate_limits: self.limiter.snapshots(),
            queues: self.queue.stats(),
            requests: self.contexts.stats(),
        }
    }

    /// Latest published health report.
    pub fn health_dashboard(&self) -> Arc<HealthReport> {
        self.health.latest()
    }

    /// Evaluates health now instead of waiting for the next tick.
    pub async fn refresh_health(&self) -> Arc<HealthReport> {
        self.health.evaluate().await
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.analyzer.report()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerCoordinator> {
        &self.circuits
    }

    pub fn contexts(&self) -> &Arc<RequestContextManager> {
        &self.contexts
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn analyzer(&self) -> &Arc<PerformanceAnalyzer> {
        &self.analyzer
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::build(BackendConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{fallback_fn, CircuitState};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_execute_records_everywhere() {
        let m = BackendManager::default();
        m.register(ServiceConfig::new("api")).unwrap();
        let v: String = m
            .execute(ExecuteOptions::new("api", "get"), |ctx| async move {
                Ok(ctx.service.clone())
            })
            .await
            .unwrap();
        assert_eq!(v, "api");
        assert_eq!(m.registry().get("api").unwrap().total_requests, 1);
        assert_eq!(m.analyzer().analyze_service("api").unwrap().request_count, 1);
        let stats = m.contexts().stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_failure_closes_context_with_error() {
        let m = BackendManager::default();
        let err = m
            .execute::<u32, _, _>(ExecuteOptions::new("api", "get"), |_| async {
                Err(Error::transient("503"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
        let stats = m.contexts().stats();
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_uses_fallback() {
        let m = BackendManager::default();
        m.configure_rate_limit(
            "search",
            RateLimitConfig::new().with_max_tokens(1).with_refill_rate(0.0),
        )
        .unwrap();
        let ok: u32 = m
            .execute(ExecuteOptions::new("search", "q"), |_| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(ok, 1);
        let err = m
            .execute::<u32, _, _>(ExecuteOptions::new("search", "q"), |_| async { Ok(2) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_ms: None, .. }));

        m.register_fallback("search", fallback_fn(|args| async move { Ok(args.unwrap_or(json!(0))) }));
        let fb: u32 = m
            .execute(
                ExecuteOptions::new("search", "q").with_fallback_args(json!(9)),
                |_| async { Ok(3) },
            )
            .await
            .unwrap();
        assert_eq!(fb, 9);
        // Rejected calls never reached the function.
        assert_eq!(m.analyzer().analyze_service("search").unwrap().request_count, 1);
    }

    #[tokio::test]
    async fn test_queued_work_flows_through_circuit() {
        let m = BackendManager::default();
        m.configure_circuit("worker", CircuitBreakerConfig::new().with_failure_threshold(1))
            .unwrap();
        m.register_processor(
            "worker",
            crate::queue::processor_fn(|_item| async { Err(Error::permanent("bad")) }),
        );
        let id = m
            .enqueue("worker", "job", json!({}), EnqueueOptions::new())
            .unwrap();
        assert!(m.queue().drain(Duration::from_secs(1)).await);
        assert!(m.queue().get_item(&id).unwrap().error.is_some());
        assert_eq!(m.circuit_breakers().state("worker"), Some(CircuitState::Open));
        assert_eq!(m.contexts().stats().failed, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let m = BackendManager::default();
        m.shutdown().await.unwrap();
        m.initialize().await.unwrap();
        m.initialize().await.unwrap();
        assert!(m.is_initialized());
        assert!(m.status().initialized);
        m.shutdown().await.unwrap();
        m.shutdown().await.unwrap();
        assert!(!m.is_initialized());
    }

    #[tokio::test]
    async fn test_subscribe_covers_all_components() {
        let m = BackendManager::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let sub = m
            .subscribe(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(sub.ids().len(), 3);
        let _: u32 = m
            .execute(ExecuteOptions::new("api", "get"), |_| async { Ok(1) })
            .await
            .unwrap();
        // request_started, call_success, request_completed
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(sub.unsubscribe(), 3);
    }

    #[tokio::test]
    async fn test_unregister_clears_records() {
        let m = BackendManager::default();
        m.register(ServiceConfig::new("tmp")).unwrap();
        let _: u32 = m
            .execute(ExecuteOptions::new("tmp", "x"), |_| async { Ok(1) })
            .await
            .unwrap();
        assert!(m.unregister("tmp"));
        assert!(m.registry().get("tmp").is_none());
        assert!(m.circuit_breakers().state("tmp").is_none());
        assert!(m.analyzer().analyze_service("tmp").is_none());
    }
}
