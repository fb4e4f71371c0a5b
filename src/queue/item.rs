use crate::utils::{duration_ms, LatencyPercentiles};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Dispatch priority; `Critical` is served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Highest first.
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl QueueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub service: String,
    pub operation: String,
    pub payload: Value,
    pub priority: Priority,
    pub status: QueueStatus,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub deduplication_key: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Last failure, handed to waiters.
    #[serde(skip)]
    pub last_error: Option<Error>,
}

/// Per-call overrides for [`enqueue`](super::QueueManager::enqueue).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub deduplication_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_deduplication_key(mut self, key: impl Into<String>) -> Self {
        self.deduplication_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending items allowed before `enqueue` overflows.
    pub max_size: usize,
    /// Items processed at once per service.
    pub max_concurrent: usize,
    #[serde(rename = "default_timeout_ms", with = "duration_ms")]
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    #[serde(rename = "deduplication_ttl_ms", with = "duration_ms")]
    pub deduplication_ttl: Duration,
    pub deduplication_capacity: usize,
    /// How long terminal items stay queryable.
    #[serde(rename = "retention_ms", with = "duration_ms")]
    pub retention: Duration,
    #[serde(rename = "dispatch_interval_ms", with = "duration_ms")]
    pub dispatch_interval: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Samples kept for wait/processing time statistics.
    pub stats_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_concurrent: 5,
            default_timeout: Duration::from_secs(30),
            default_max_retries: 3,
            deduplication_ttl: Duration::from_secs(60),
            deduplication_capacity: 10_000,
            retention: Duration::from_secs(300),
            dispatch_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(60),
            stats_window: 1000,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_deduplication_ttl(mut self, ttl: Duration) -> Self {
        self.deduplication_ttl = ttl;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: &str| {
            Err(Error::configuration_with_context(
                msg.to_string(),
                ErrorContext::new()
                    .with_field_path(format!("queue.{}", field))
                    .with_source("request_queue"),
            ))
        };
        if self.max_size == 0 {
            return invalid("max_size", "max_size must be at least 1");
        }
        if self.max_concurrent == 0 {
            return invalid("max_concurrent", "max_concurrent must be at least 1");
        }
        if self.default_timeout.is_zero() {
            return invalid("default_timeout_ms", "default timeout must be positive");
        }
        if self.deduplication_capacity == 0 {
            return invalid(
                "deduplication_capacity",
                "deduplication_capacity must be at least 1",
            );
        }
        if self.dispatch_interval.is_zero() {
            return invalid("dispatch_interval_ms", "dispatch interval must be positive");
        }
        Ok(())
    }
}

/// Point-in-time view of one service queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub service: String,
    pub pending: usize,
    pub pending_by_priority: BTreeMap<Priority, usize>,
    pub processing: usize,
    pub tracked_items: usize,
    pub max_size: usize,
    pub max_concurrent: usize,
    pub has_processor: bool,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub rejected: u64,
    pub deduplicated: u64,
    pub wait_time: LatencyPercentiles,
    pub processing_time: LatencyPercentiles,
    pub throughput_per_sec: f64,
}

/// Totals across every service queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total_pending: usize,
    pub total_processing: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub avg_wait_ms: f64,
    pub avg_processing_ms: f64,
    pub throughput_per_sec: f64,
    pub services: Vec<QueueSnapshot>,
}
