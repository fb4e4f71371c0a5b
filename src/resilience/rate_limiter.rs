use crate::utils::{lock, read, write};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity (tokens).
    pub max_tokens: f64,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl RateLimitConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self {
            max_tokens: 10.0,
            refill_rate: 10.0,
        }
    }

    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps < 0.0 {
            return None;
        }
        Some(Self {
            refill_rate: rps,
            max_tokens: rps.max(1.0), // default burst: 1 second worth, at least 1
        })
    }

    /// Set the maximum tokens (burst size)
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens as f64;
        self
    }

    /// Set the refill rate (tokens per second)
    pub fn with_refill_rate(mut self, rate: f64) -> Self {
        self.refill_rate = rate;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.max_tokens.is_finite() || self.max_tokens <= 0.0 {
            return Err(Error::configuration_with_context(
                "max_tokens must be a positive number",
                ErrorContext::new()
                    .with_field_path("rate_limit.max_tokens")
                    .with_source("rate_limiter"),
            ));
        }
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(Error::configuration_with_context(
                "refill_rate must be zero or positive",
                ErrorContext::new()
                    .with_field_path("rate_limit.refill_rate")
                    .with_source("rate_limiter"),
            ));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a non-blocking admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    Allowed {
        remaining: f64,
    },
    Denied {
        /// Time until the requested tokens are available; `None` if the bucket never refills.
        retry_after: Option<Duration>,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub service: String,
    pub tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub total_requests: u64,
    pub allowed_requests: u64,
    /// Share of the bucket currently drained, in [0, 1].
    pub utilization: f64,
    /// Share of requests denied so far, in [0, 1].
    pub denial_rate: f64,
    /// Estimated wait time until a single token is available (ms), if currently empty.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    total_requests: u64,
    allowed_requests: u64,
}

impl Bucket {
    fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            tokens: cfg.max_tokens,
            max_tokens: cfg.max_tokens,
            refill_rate: cfg.refill_rate,
            last_refill: Instant::now(),
            total_requests: 0,
            allowed_requests: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).clamp(0.0, self.max_tokens);
            self.last_refill = now;
        }
    }

    fn wait_for(&self, n: f64) -> Option<Duration> {
        if self.tokens >= n {
            return Some(Duration::ZERO);
        }
        if self.refill_rate <= 0.0 {
            return None;
        }
        let secs = (n - self.tokens) / self.refill_rate;
        Some(Duration::from_secs_f64(secs).max(Duration::from_millis(1)))
    }

    fn try_consume(&mut self, n: f64) -> RateLimitDecision {
        self.refill();
        self.total_requests += 1;
        if self.tokens >= n {
            self.tokens -= n;
            self.allowed_requests += 1;
            RateLimitDecision::Allowed {
                remaining: self.tokens,
            }
        } else {
            RateLimitDecision::Denied {
                retry_after: self.wait_for(n),
            }
        }
    }

    fn snapshot(&mut self, service: &str) -> RateLimitSnapshot {
        self.refill();
        let estimated_wait_ms = if self.tokens < 1.0 {
            self.wait_for(1.0).map(|d| d.as_millis() as u64)
        } else {
            None
        };
        RateLimitSnapshot {
            service: service.to_string(),
            tokens: self.tokens,
            max_tokens: self.max_tokens,
            refill_rate: self.refill_rate,
            total_requests: self.total_requests,
            allowed_requests: self.allowed_requests,
            utilization: 1.0 - self.tokens / self.max_tokens,
            denial_rate: if self.total_requests == 0 {
                0.0
            } else {
                1.0 - self.allowed_requests as f64 / self.total_requests as f64
            },
            estimated_wait_ms,
        }
    }
}

/// Per-service token buckets.
///
/// Refill is computed from elapsed time at check time; there is no background timer.
/// Services without a bucket are unlimited unless a default config is set.
pub struct RateLimiter {
    default_config: Option<RateLimitConfig>,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            default_config: None,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Every service without an explicit bucket gets one built from `config` on first use.
    pub fn with_default(config: RateLimitConfig) -> Self {
        Self {
            default_config: Some(config),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Installs a fresh, full bucket for `service`.
    pub fn configure(&self, service: &str, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        write(&self.buckets).insert(service.to_string(), Arc::new(Mutex::new(Bucket::new(&config))));
        debug!(
            service,
            max_tokens = config.max_tokens,
            refill_rate = config.refill_rate,
            "rate limit configured"
        );
        Ok(())
    }

    pub fn is_configured(&self, service: &str) -> bool {
        read(&self.buckets).contains_key(service)
    }

    fn bucket(&self, service: &str) -> Option<Arc<Mutex<Bucket>>> {
        if let Some(b) = read(&self.buckets).get(service) {
            return Some(Arc::clone(b));
        }
        let cfg = self.default_config.as_ref()?;
        let mut buckets = write(&self.buckets);
        Some(Arc::clone(
            buckets
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(cfg)))),
        ))
    }

    /// Refills, then deducts `n` tokens or denies. One critical section per call.
    pub fn try_consume(&self, service: &str, n: u32) -> RateLimitDecision {
        let Some(bucket) = self.bucket(service) else {
            return RateLimitDecision::Allowed {
                remaining: f64::INFINITY,
            };
        };
        let decision = lock(&bucket).try_consume(n as f64);
        if let RateLimitDecision::Denied { retry_after } = decision {
            debug!(
                service,
                tokens = n,
                retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                "rate limit denied"
            );
        }
        decision
    }

    /// Like [`try_consume`](Self::try_consume) but as a `Result`.
    pub fn check(&self, service: &str, n: u32) -> Result<()> {
        match self.try_consume(service, n) {
            RateLimitDecision::Allowed { .. } => Ok(()),
            RateLimitDecision::Denied { retry_after } => Err(Error::RateLimited {
                service: service.to_string(),
                retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            }),
        }
    }

    /// Waits for `n` tokens, giving up with `RateLimited` once `max_wait` would be exceeded.
    pub async fn acquire(&self, service: &str, n: u32, max_wait: Duration) -> Result<()> {
        let Some(bucket) = self.bucket(service) else {
            return Ok(());
        };
        let deadline = Instant::now() + max_wait;
        loop {
            let wait = {
                let mut b = lock(&bucket);
                if n as f64 > b.max_tokens {
                    return Err(Error::validation_with_context(
                        format!("requested {} tokens but bucket capacity is {}", n, b.max_tokens),
                        ErrorContext::new()
                            .with_field_path(format!("rate_limit.{}", service))
                            .with_source("rate_limiter"),
                    ));
                }
                match b.try_consume(n as f64) {
                    RateLimitDecision::Allowed { .. } => return Ok(()),
                    RateLimitDecision::Denied { retry_after } => retry_after,
                }
            };
            let now = Instant::now();
            match wait {
                Some(w) if now + w <= deadline => tokio::time::sleep(w).await,
                _ => {
                    return Err(Error::RateLimited {
                        service: service.to_string(),
                        retry_after_ms: wait.map(|d| d.as_millis() as u64),
                    })
                }
            }
        }
    }

    pub fn snapshot(&self, service: &str) -> Option<RateLimitSnapshot> {
        read(&self.buckets)
            .get(service)
            .map(|b| lock(b).snapshot(service))
    }

    pub fn snapshots(&self) -> Vec<RateLimitSnapshot> {
        let buckets = read(&self.buckets);
        let mut out: Vec<_> = buckets
            .iter()
            .map(|(name, b)| lock(b).snapshot(name))
            .collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    /// Refills the bucket to capacity and clears its counters.
    pub fn reset(&self, service: &str) -> bool {
        match read(&self.buckets).get(service) {
            Some(b) => {
                let mut b = lock(b);
                b.tokens = b.max_tokens;
                b.last_refill = Instant::now();
                b.total_requests = 0;
                b.allowed_requests = 0;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, service: &str) -> bool {
        write(&self.buckets).remove(service).is_some()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
