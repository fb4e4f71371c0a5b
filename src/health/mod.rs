//! Health scoring, status classification, alerts and trends.
//!
//! The [`HealthAggregator`] periodically combines registry counters, analyzer metrics, circuit
//! state and rate-limiter utilization into a [`HealthReport`]. The latest report is published
//! through an `ArcSwap`, so readers never block the evaluation tick.

mod aggregator;
pub mod score;

pub use aggregator::HealthAggregator;

use crate::registry::Criticality;
use crate::resilience::CircuitState;
use crate::utils::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Critical => "critical",
        }
    }

    /// Weight of a service's score in the overall mean.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 2.0,
            Self::Unhealthy | Self::Critical => 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub service: String,
    pub severity: AlertSeverity,
    pub message: String,
    /// Epoch milliseconds.
    pub timestamp: u64,
    pub acknowledged: bool,
}

/// Three cut points for one metric. For uptime the values decrease from healthy to critical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub healthy: f64,
    pub degraded: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    pub latency_ms: MetricThresholds,
    pub error_rate: MetricThresholds,
    pub uptime: MetricThresholds,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            latency_ms: MetricThresholds {
                healthy: 500.0,
                degraded: 2000.0,
                critical: 5000.0,
            },
            error_rate: MetricThresholds {
                healthy: 0.01,
                degraded: 0.1,
                critical: 0.25,
            },
            uptime: MetricThresholds {
                healthy: 0.99,
                degraded: 0.9,
                critical: 0.75,
            },
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> crate::Result<()> {
        let ordered_up = |m: &MetricThresholds| m.healthy <= m.degraded && m.degraded <= m.critical;
        let ordered_down = |m: &MetricThresholds| m.healthy >= m.degraded && m.degraded >= m.critical;
        let fail = |field: &str, msg: &str| {
            Err(crate::Error::configuration_with_context(
                msg.to_string(),
                crate::ErrorContext::new()
                    .with_field_path(format!("health.thresholds.{}", field))
                    .with_source("health"),
            ))
        };
        if !ordered_up(&self.latency_ms) {
            return fail("latency_ms", "latency thresholds must increase healthy <= degraded <= critical");
        }
        if !ordered_up(&self.error_rate) {
            return fail("error_rate", "error rate thresholds must increase healthy <= degraded <= critical");
        }
        if !ordered_down(&self.uptime) {
            return fail("uptime", "uptime thresholds must decrease healthy >= degraded >= critical");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    /// Limit for each registered health-check callback.
    #[serde(rename = "check_timeout_ms", with = "duration_ms")]
    pub check_timeout: Duration,
    /// Run registered health checks as part of each evaluation.
    pub run_health_checks: bool,
    pub thresholds: HealthThresholds,
    #[serde(rename = "alert_dedup_window_ms", with = "duration_ms")]
    pub alert_dedup_window: Duration,
    pub max_alerts: usize,
    /// Scores per half of the trend comparison.
    pub trend_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
            run_health_checks: true,
            thresholds: HealthThresholds::default(),
            alert_dedup_window: Duration::from_secs(300),
            max_alerts: 100,
            trend_window: 5,
        }
    }
}

/// Inputs to the score of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceMetrics {
    pub latency_ms: f64,
    pub error_rate: f64,
    /// Share of passed health checks in [0, 1].
    pub uptime: f64,
    pub request_count: usize,
    pub circuit_state: Option<CircuitState>,
    pub health_check_passing: Option<bool>,
    pub rate_limit_utilization: Option<f64>,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            error_rate: 0.0,
            uptime: 1.0,
            request_count: 0,
            circuit_state: None,
            health_check_passing: None,
            rate_limit_utilization: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub criticality: Criticality,
    pub score: f64,
    pub status: HealthStatus,
    pub metrics: ServiceMetrics,
    pub deductions: score::Deductions,
    pub recommendations: Vec<String>,
    pub trend: TrendDirection,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: u64,
    pub overall_score: f64,
    pub overall_status: HealthStatus,
    pub overall_trend: TrendDirection,
    pub services: Vec<ServiceHealth>,
    /// Unacknowledged alerts, newest last.
    pub alerts: Vec<Alert>,
}

impl HealthReport {
    /// Report used before the first evaluation.
    pub fn empty() -> Self {
        Self {
            generated_at: 0,
            overall_score: 100.0,
            overall_status: HealthStatus::Healthy,
            overall_trend: TrendDirection::Stable,
            services: Vec::new(),
            alerts: Vec::new(),
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceHealth> {
        self.services.iter().find(|s| s.service == name)
    }
}
