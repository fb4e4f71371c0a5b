//! Pure scoring functions: metrics in, score/status/trend out.

use super::{HealthStatus, HealthThresholds, ServiceMetrics, TrendDirection};
use crate::resilience::CircuitState;
use serde::Serialize;

pub const LATENCY_MAX_DEDUCTION: f64 = 30.0;
pub const ERROR_RATE_MAX_DEDUCTION: f64 = 40.0;
pub const UPTIME_MAX_DEDUCTION: f64 = 30.0;
/// Average-score difference that counts as a trend.
pub const TREND_DELTA: f64 = 5.0;

/// Points taken off a perfect 100, per metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Deductions {
    pub latency: f64,
    pub error_rate: f64,
    pub uptime: f64,
}

impl Deductions {
    pub fn total(&self) -> f64 {
        self.latency + self.error_rate + self.uptime
    }
}

/// Linear position of `value` between `start` (0.0) and `end` (1.0), clamped.
fn progress(value: f64, start: f64, end: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let span = end - start;
    if span.abs() < f64::EPSILON {
        return if (end >= start && value >= end) || (end < start && value <= end) {
            1.0
        } else {
            0.0
        };
    }
    ((value - start) / span).clamp(0.0, 1.0)
}

pub fn deductions(metrics: &ServiceMetrics, thresholds: &HealthThresholds) -> Deductions {
    let lat = &thresholds.latency_ms;
    let err = &thresholds.error_rate;
    let up = &thresholds.uptime;
    Deductions {
        latency: LATENCY_MAX_DEDUCTION * progress(metrics.latency_ms, lat.healthy, lat.degraded),
        error_rate: ERROR_RATE_MAX_DEDUCTION
            * progress(metrics.error_rate, err.healthy, err.degraded),
        // Uptime falls as things get worse, so the scale runs downwards.
        uptime: UPTIME_MAX_DEDUCTION * progress(metrics.uptime, up.healthy, up.degraded),
    }
}

/// 0-100 score: 100 minus capped deductions.
pub fn score(metrics: &ServiceMetrics, thresholds: &HealthThresholds) -> f64 {
    (100.0 - deductions(metrics, thresholds).total()).clamp(0.0, 100.0)
}

pub fn crosses_critical(metrics: &ServiceMetrics, thresholds: &HealthThresholds) -> bool {
    metrics.latency_ms >= thresholds.latency_ms.critical
        || metrics.error_rate >= thresholds.error_rate.critical
        || metrics.uptime <= thresholds.uptime.critical
}

pub fn classify(metrics: &ServiceMetrics, score: f64, thresholds: &HealthThresholds) -> HealthStatus {
    if crosses_critical(metrics, thresholds) {
        HealthStatus::Critical
    } else if metrics.health_check_passing == Some(false)
        || metrics.circuit_state == Some(CircuitState::Open)
        || score < 50.0
    {
        HealthStatus::Unhealthy
    } else if score < 80.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Status-weighted mean of `(score, status)` pairs; 100 when empty.
pub fn overall_score(services: &[(f64, HealthStatus)]) -> f64 {
    let (sum, weights) = services
        .iter()
        .fold((0.0, 0.0), |(sum, w), (score, status)| {
            (sum + score * status.weight(), w + status.weight())
        });
    if weights == 0.0 {
        100.0
    } else {
        sum / weights
    }
}

pub fn overall_status(services: &[(f64, HealthStatus)], overall: f64) -> HealthStatus {
    let worst = services
        .iter()
        .map(|(_, s)| *s)
        .max()
        .unwrap_or(HealthStatus::Healthy);
    if worst == HealthStatus::Critical {
        HealthStatus::Critical
    } else if worst == HealthStatus::Unhealthy || overall < 50.0 {
        HealthStatus::Unhealthy
    } else if worst == HealthStatus::Degraded || overall < 80.0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Compares the mean of the latest `window` scores with the `window` before them.
pub fn trend(history: &[f64], window: usize) -> TrendDirection {
    let window = window.max(1).min(history.len() / 2);
    if window == 0 {
        return TrendDirection::Stable;
    }
    let n = history.len();
    let recent = &history[n - window..];
    let prior = &history[n - 2 * window..n - window];
    let avg = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
    let delta = avg(recent) - avg(prior);
    if delta > TREND_DELTA {
        TrendDirection::Improving
    } else if delta < -TREND_DELTA {
        TrendDirection::Degrading
    } else {
        TrendDirection::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(latency_ms: f64, error_rate: f64, uptime: f64) -> ServiceMetrics {
        ServiceMetrics {
            latency_ms,
            error_rate,
            uptime,
            ..ServiceMetrics::default()
        }
    }

    #[test]
    fn test_within_healthy_thresholds_scores_100() {
        let t = HealthThresholds::default();
        let m = metrics(100.0, 0.0, 1.0);
        assert_eq!(score(&m, &t), 100.0);
        assert_eq!(classify(&m, 100.0, &t), HealthStatus::Healthy);
    }

    #[test]
    fn test_all_degraded_thresholds_score_near_zero() {
        let t = HealthThresholds::default();
        let m = metrics(t.latency_ms.degraded, t.error_rate.degraded, t.uptime.degraded);
        let s = score(&m, &t);
        assert!(s <= 10.0, "score {}", s);
        assert_eq!(classify(&m, s, &t), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_deductions_scale_proportionally() {
        let t = HealthThresholds::default();
        let mid = (t.latency_ms.healthy + t.latency_ms.degraded) / 2.0;
        let d = deductions(&metrics(mid, 0.0, 1.0), &t);
        assert!((d.latency - 15.0).abs() < 1e-9);
        assert_eq!(d.error_rate, 0.0);
        assert_eq!(d.uptime, 0.0);
        // Past the degraded threshold the deduction stays capped.
        let capped = deductions(&metrics(t.latency_ms.degraded * 10.0, 0.0, 1.0), &t);
        assert_eq!(capped.latency, LATENCY_MAX_DEDUCTION);
    }

    #[test]
    fn test_critical_threshold_wins() {
        let t = HealthThresholds::default();
        let m = metrics(10.0, t.error_rate.critical, 1.0);
        assert_eq!(classify(&m, score(&m, &t), &t), HealthStatus::Critical);
    }

    #[test]
    fn test_open_circuit_or_failing_check_is_unhealthy() {
        let t = HealthThresholds::default();
        let mut m = metrics(10.0, 0.0, 1.0);
        m.circuit_state = Some(CircuitState::Open);
        assert_eq!(classify(&m, 100.0, &t), HealthStatus::Unhealthy);
        m.circuit_state = Some(CircuitState::Closed);
        m.health_check_passing = Some(false);
        assert_eq!(classify(&m, 100.0, &t), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_overall_weighting() {
        let services = [(100.0, HealthStatus::Healthy), (70.0, HealthStatus::Degraded)];
        // (100*1 + 70*2) / 3
        assert!((overall_score(&services) - 80.0).abs() < 1e-9);
        assert_eq!(overall_status(&services, 80.0), HealthStatus::Degraded);
        assert_eq!(overall_score(&[]), 100.0);
        assert_eq!(overall_status(&[], 100.0), HealthStatus::Healthy);
        let bad = [(90.0, HealthStatus::Healthy), (0.0, HealthStatus::Critical)];
        assert_eq!(overall_status(&bad, overall_score(&bad)), HealthStatus::Critical);
    }

    #[test]
    fn test_trend_direction() {
        assert_eq!(trend(&[], 5), TrendDirection::Stable);
        assert_eq!(trend(&[50.0], 5), TrendDirection::Stable);
        assert_eq!(trend(&[50.0, 60.0], 5), TrendDirection::Improving);
        assert_eq!(trend(&[90.0, 90.0, 70.0, 70.0], 2), TrendDirection::Degrading);
        assert_eq!(trend(&[80.0, 82.0, 81.0, 83.0], 2), TrendDirection::Stable);
    }

    #[test]
    fn test_trend_serializes_as_degrading() {
        assert_eq!(
            serde_json::to_value(TrendDirection::Degrading).unwrap(),
            serde_json::json!("degrading")
        );
    }
}
