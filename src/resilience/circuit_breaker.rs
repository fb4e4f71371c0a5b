//! Per-service circuit breakers.
//!
//! # State Transitions
//! ```text
//! Closed    → Open:      consecutive failures >= failure_threshold
//! Open      → HalfOpen:  next call attempt after reset_timeout since the last failure
//! HalfOpen  → Closed:    successes >= success_threshold
//! HalfOpen  → Open:      any failure
//! ```
//!
//! Each wrapped call runs under a hard timeout; a timeout counts as a failure. The circuit
//! never looks at the error class. While a circuit refuses calls, a registered
//! [`Fallback`] answers instead, otherwise the caller gets [`Error::CircuitOpen`].

use crate::events::{BackendEvent, EventBus, RejectionReason, Subscription};
use crate::utils::{duration_ms, lock, now_ms, read, write};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Hard deadline for every wrapped call.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Cooldown after the last failure before a probe is admitted.
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    /// Alias for with_reset_timeout
    pub fn with_cooldown(self, cooldown: Duration) -> Self {
        self.with_reset_timeout(cooldown)
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("half_open_max_calls", self.half_open_max_calls),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::configuration_with_context(
                    format!("{} must be at least 1", field),
                    ErrorContext::new()
                        .with_field_path(format!("circuit.{}", field))
                        .with_source("circuit_breaker"),
                ));
            }
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration_with_context(
                "timeout must be greater than zero",
                ErrorContext::new()
                    .with_field_path("circuit.timeout_ms")
                    .with_source("circuit_breaker"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CallStatistics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timeout_calls: u64,
    pub rejected_calls: u64,
    pub fallback_calls: u64,
    /// Outcomes that arrived after the circuit had already changed state.
    pub stale_outcomes: u64,
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    /// Epoch milliseconds of the last failure.
    pub last_failure_time: Option<u64>,
    /// Epoch milliseconds of the last transition (or creation).
    pub last_state_change: u64,
    /// Remaining cooldown while open.
    pub open_remaining_ms: Option<u64>,
    pub config: CircuitBreakerConfig,
    pub stats: CallStatistics,
}

#[derive(Debug)]
struct Circuit {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    last_failure_ms: Option<u64>,
    last_state_change_ms: u64,
    /// Bumped on every transition; outcomes carry the generation they were admitted under.
    generation: u64,
    stats: CallStatistics,
}

impl Circuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure: None,
            last_failure_ms: None,
            last_state_change_ms: now_ms(),
            generation: 0,
            stats: CallStatistics::default(),
        }
    }

    fn transition(&mut self, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.last_state_change_ms = now_ms();
        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.half_open_calls = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                self.half_open_calls = 0;
            }
            CircuitState::Open => {
                self.success_count = 0;
                self.half_open_calls = 0;
            }
        }
        (from, to)
    }

    fn open_remaining(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        self.config.reset_timeout.checked_sub(elapsed)
    }

    fn snapshot(&self, service: &str) -> CircuitSnapshot {
        CircuitSnapshot {
            service: service.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            half_open_calls: self.half_open_calls,
            last_failure_time: self.last_failure_ms,
            last_state_change: self.last_state_change_ms,
            open_remaining_ms: self.open_remaining().map(|d| d.as_millis() as u64),
            config: self.config.clone(),
            stats: self.stats.clone(),
        }
    }
}

enum Admission {
    Allowed {
        generation: u64,
        probe: bool,
        timeout: Duration,
    },
    Rejected {
        reason: RejectionReason,
        retry_after_ms: Option<u64>,
    },
}

enum Outcome {
    Success(Duration),
    Failure(Duration, String),
    Timeout(Duration),
}

/// Answers for a service while its circuit refuses calls.
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn call(&self, service: &str, args: Option<Value>) -> Result<Value>;
}

/// Adapter turning an async closure into a [`Fallback`].
pub struct FnFallback<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Fallback for FnFallback<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, _service: &str, args: Option<Value>) -> Result<Value> {
        (self.f)(args).await
    }
}

pub fn fallback_fn<F, Fut>(f: F) -> Arc<dyn Fallback>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnFallback { f })
}

/// Releases a half-open probe slot if the wrapped call is dropped before it reports.
struct ProbeGuard<'a> {
    circuit: &'a Mutex<Circuit>,
    generation: u64,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut c = lock(self.circuit);
            if c.generation == self.generation {
                c.half_open_calls = c.half_open_calls.saturating_sub(1);
            }
        }
    }
}

/// Registry of circuits keyed by service name.
pub struct CircuitBreakerCoordinator {
    default_config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<Circuit>>>>,
    fallbacks: RwLock<HashMap<String, Arc<dyn Fallback>>>,
    events: EventBus,
}

impl CircuitBreakerCoordinator {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            circuits: RwLock::new(HashMap::new()),
            fallbacks: RwLock::new(HashMap::new()),
            events: EventBus::new("circuit_breaker"),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(&BackendEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Sets the config for `service`, creating its circuit if needed. Existing state is kept.
    pub fn configure(&self, service: &str, config: CircuitBreakerConfig) -> Result<()> {
        config.validate()?;
        let circuit = self.circuit(service);
        lock(&circuit).config = config;
        debug!(service, "circuit breaker configured");
        Ok(())
    }

    pub fn register_fallback(&self, service: &str, fallback: Arc<dyn Fallback>) {
        write(&self.fallbacks).insert(service.to_string(), fallback);
    }

    pub fn remove_fallback(&self, service: &str) -> bool {
        write(&self.fallbacks).remove(service).is_some()
    }

    pub fn has_fallback(&self, service: &str) -> bool {
        read(&self.fallbacks).contains_key(service)
    }

    fn circuit(&self, service: &str) -> Arc<Mutex<Circuit>> {
        if let Some(c) = read(&self.circuits).get(service) {
            return Arc::clone(c);
        }
        let mut circuits = write(&self.circuits);
        Arc::clone(
            circuits
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(self.default_config.clone())))),
        )
    }

    fn emit_transition(&self, service: &str, from: CircuitState, to: CircuitState) {
        info!(
            service,
            from = from.as_str(),
            to = to.as_str(),
            "circuit state changed"
        );
        self.events.emit(BackendEvent::StateChange {
            service: service.to_string(),
            from,
            to,
        });
    }

    fn admit(&self, service: &str, circuit: &Mutex<Circuit>) -> Admission {
        let mut transition = None;
        let admission = {
            let mut c = lock(circuit);
            if c.state == CircuitState::Open && c.open_remaining().is_none() {
                transition = Some(c.transition(CircuitState::HalfOpen));
            }
            match c.state {
                CircuitState::Closed => {
                    c.stats.total_calls += 1;
                    Admission::Allowed {
                        generation: c.generation,
                        probe: false,
                        timeout: c.config.timeout,
                    }
                }
                CircuitState::HalfOpen if c.half_open_calls < c.config.half_open_max_calls => {
                    c.half_open_calls += 1;
                    c.stats.total_calls += 1;
                    Admission::Allowed {
                        generation: c.generation,
                        probe: true,
                        timeout: c.config.timeout,
                    }
                }
                CircuitState::HalfOpen => Admission::Rejected {
                    reason: RejectionReason::HalfOpenSaturated,
                    retry_after_ms: None,
                },
                CircuitState::Open => Admission::Rejected {
                    reason: RejectionReason::CircuitOpen,
                    retry_after_ms: c.open_remaining().map(|d| d.as_millis() as u64),
                },
            }
        };
        if let Some((from, to)) = transition {
            self.emit_transition(service, from, to);
        }
        admission
    }

    fn record(&self, service: &str, circuit: &Mutex<Circuit>, generation: u64, outcome: &Outcome) {
        let mut transition = None;
        {
            let mut c = lock(circuit);
            match outcome {
                Outcome::Success(_) => c.stats.successful_calls += 1,
                Outcome::Failure(..) => c.stats.failed_calls += 1,
                Outcome::Timeout(_) => {
                    c.stats.failed_calls += 1;
                    c.stats.timeout_calls += 1;
                }
            }

            if c.generation != generation {
                c.stats.stale_outcomes += 1;
                debug!(service, "discarding stale call outcome");
            } else {
                let failed = !matches!(outcome, Outcome::Success(_));
                if c.state == CircuitState::HalfOpen {
                    c.half_open_calls = c.half_open_calls.saturating_sub(1);
                }
                if failed {
                    c.last_failure = Some(Instant::now());
                    c.last_failure_ms = Some(now_ms());
                }
                match (c.state, failed) {
                    (CircuitState::Closed, false) => c.failure_count = 0,
                    (CircuitState::Closed, true) => {
                        c.failure_count = c.failure_count.saturating_add(1);
                        if c.failure_count >= c.config.failure_threshold {
                            transition = Some(c.transition(CircuitState::Open));
                        }
                    }
                    (CircuitState::HalfOpen, false) => {
                        c.success_count += 1;
                        if c.success_count >= c.config.success_threshold {
                            transition = Some(c.transition(CircuitState::Closed));
                        }
                    }
                    (CircuitState::HalfOpen, true) => {
                        c.failure_count = c.failure_count.saturating_add(1);
                        transition = Some(c.transition(CircuitState::Open));
                    }
                    (CircuitState::Open, _) => {}
                }
            }
        }

        let event = match outcome {
            Outcome::Success(d) => BackendEvent::CallSuccess {
                service: service.to_string(),
                duration_ms: d.as_millis() as u64,
            },
            Outcome::Failure(d, msg) => BackendEvent::CallFailure {
                service: service.to_string(),
                error: msg.clone(),
                duration_ms: d.as_millis() as u64,
            },
            Outcome::Timeout(t) => BackendEvent::CallTimeout {
                service: service.to_string(),
                timeout_ms: t.as_millis() as u64,
            },
        };
        self.events.emit(event);
        if let Some((from, to)) = transition {
            self.emit_transition(service, from, to);
        }
    }

    /// Runs `f` through the circuit for `service`.
    ///
    /// `fallback_args` are handed to the registered fallback when the circuit refuses the call.
    pub async fn execute<T, F, Fut>(
        &self,
        service: &str,
        operation: &str,
        f: F,
        fallback_args: Option<Value>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DeserializeOwned,
    {
        let circuit = self.circuit(service);
        let (generation, probe, timeout) = match self.admit(service, &circuit) {
            Admission::Allowed {
                generation,
                probe,
                timeout,
            } => (generation, probe, timeout),
            Admission::Rejected {
                reason,
                retry_after_ms,
            } => {
                let err = Error::CircuitOpen {
                    service: service.to_string(),
                    retry_after_ms,
                };
                return self.reject(service, reason, fallback_args, err).await;
            }
        };

        let mut guard = ProbeGuard {
            circuit: &circuit,
            generation,
            armed: probe,
        };
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, f()).await;
        let elapsed = start.elapsed();
        guard.armed = false;

        match result {
            Ok(Ok(value)) => {
                self.record(service, &circuit, generation, &Outcome::Success(elapsed));
                Ok(value)
            }
            Ok(Err(e)) => {
                debug!(service, operation, error = %e, "wrapped call failed");
                self.record(
                    service,
                    &circuit,
                    generation,
                    &Outcome::Failure(elapsed, e.to_string()),
                );
                Err(e)
            }
            Err(_) => {
                warn!(
                    service,
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "wrapped call timed out"
                );
                self.record(service, &circuit, generation, &Outcome::Timeout(timeout));
                Err(Error::Timeout {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Handles a policy rejection for `service`: runs the registered fallback with
    /// `fallback_args`, or returns `error` unchanged when no fallback exists or the
    /// error is not a policy rejection.
    pub async fn reject<T: DeserializeOwned>(
        &self,
        service: &str,
        reason: RejectionReason,
        fallback_args: Option<Value>,
        error: Error,
    ) -> Result<T> {
        let fallback = if error.code().fallbackable() {
            read(&self.fallbacks).get(service).cloned()
        } else {
            None
        };
        {
            let circuit = self.circuit(service);
            let mut c = lock(&circuit);
            c.stats.rejected_calls += 1;
            if fallback.is_some() {
                c.stats.fallback_calls += 1;
            }
        }
        debug!(
            service,
            reason = ?reason,
            fallback = fallback.is_some(),
            "call rejected"
        );
        self.events.emit(BackendEvent::CallRejected {
            service: service.to_string(),
            reason,
            fallback_used: fallback.is_some(),
        });
        match fallback {
            Some(fb) => {
                let value = fb.call(service, fallback_args).await?;
                Ok(serde_json::from_value(value)?)
            }
            None => Err(error),
        }
    }

    pub fn state(&self, service: &str) -> Option<CircuitState> {
        read(&self.circuits).get(service).map(|c| lock(c).state)
    }

    pub fn snapshot(&self, service: &str) -> Option<CircuitSnapshot> {
        read(&self.circuits)
            .get(service)
            .map(|c| lock(c).snapshot(service))
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let circuits = read(&self.circuits);
        let mut out: Vec<_> = circuits
            .iter()
            .map(|(name, c)| lock(c).snapshot(name))
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    /// Forces the circuit closed and clears its counters.
    pub fn reset(&self, service: &str) -> Result<()> {
        let circuit = read(&self.circuits)
            .get(service)
            .cloned()
            .ok_or_else(|| Error::not_found("circuit", service))?;
        let transition = {
            let mut c = lock(&circuit);
            let t = c.transition(CircuitState::Closed);
            c.last_failure = None;
            c.last_failure_ms = None;
            t
        };
        if transition.0 != transition.1 {
            self.emit_transition(service, transition.0, transition.1);
        }
        Ok(())
    }

    /// Opens the circuit as if it had just failed.
    pub fn force_open(&self, service: &str) {
        let circuit = self.circuit(service);
        let transition = {
            let mut c = lock(&circuit);
            c.last_failure = Some(Instant::now());
            c.last_failure_ms = Some(now_ms());
            c.transition(CircuitState::Open)
        };
        if transition.0 != transition.1 {
            self.emit_transition(service, transition.0, transition.1);
        }
    }

    pub fn remove(&self, service: &str) -> bool {
        self.remove_fallback(service);
        write(&self.circuits).remove(service).is_some()
    }
}

impl Default for CircuitBreakerCoordinator {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
