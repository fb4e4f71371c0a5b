//! Performance analysis over bounded per-service metric buffers.
//!
//! Samples are named values tagged with a service and optionally an operation.
//! [`PerformanceAnalyzer::record_request`] is a shorthand that records a `latency` sample and an
//! `error` sample (1.0 on failure) in one call.

use crate::utils::{
    duration_ms, lock, millis_f64, now_ms, percentile, read, write, SlidingWindow,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

pub const LATENCY_METRIC: &str = "latency";
pub const ERROR_METRIC: &str = "error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub service: String,
    pub operation: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerThresholds {
    /// Average latency (ms) above which a service is a bottleneck.
    pub latency_ms: f64,
    pub p95_latency_ms: f64,
    /// Error ratio in [0, 1].
    pub error_rate: f64,
    /// Requests needed before the error rate is judged.
    pub min_requests: usize,
    /// Average-value thresholds for caller-defined metrics.
    pub custom: BTreeMap<String, f64>,
}

impl Default for AnalyzerThresholds {
    fn default() -> Self {
        Self {
            latency_ms: 1000.0,
            p95_latency_ms: 2000.0,
            error_rate: 0.05,
            min_requests: 5,
            custom: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Samples kept per service.
    pub buffer_size: usize,
    #[serde(rename = "throughput_window_ms", with = "duration_ms")]
    pub throughput_window: Duration,
    pub thresholds: AnalyzerThresholds,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            throughput_window: Duration::from_secs(60),
            thresholds: AnalyzerThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// From how far `value` overshoots `threshold`.
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 3.0 {
            Self::Critical
        } else if ratio >= 2.0 {
            Self::High
        } else if ratio >= 1.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    Latency,
    P95Latency,
    ErrorRate,
    Custom,
}

#[derive(Debug, Clone, Serialize)]
pub struct Bottleneck {
    pub service: String,
    pub operation: Option<String>,
    pub kind: BottleneckKind,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub operation: String,
    pub requests: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceAnalysis {
    pub service: String,
    pub sample_count: usize,
    pub request_count: usize,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Requests per second over the throughput window.
    pub throughput_per_sec: f64,
    pub error_rate: f64,
    pub operations: Vec<OperationStats>,
    /// Average of each caller-defined metric.
    pub custom_metrics: BTreeMap<String, f64>,
    pub bottlenecks: Vec<Bottleneck>,
    pub analyzed_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: u64,
    pub total_requests: usize,
    pub overall_error_rate: f64,
    pub avg_latency_ms: f64,
    pub services: Vec<ServiceAnalysis>,
    /// Every bottleneck, most severe first.
    pub bottlenecks: Vec<Bottleneck>,
}

#[derive(Default)]
struct OpAccumulator {
    latencies: Vec<f64>,
    errors: usize,
    requests: usize,
}

pub struct PerformanceAnalyzer {
    config: RwLock<AnalyzerConfig>,
    buffers: RwLock<HashMap<String, Arc<Mutex<SlidingWindow<MetricSample>>>>>,
}

impl PerformanceAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> AnalyzerThresholds {
        read(&self.config).thresholds.clone()
    }

    pub fn set_thresholds(&self, thresholds: AnalyzerThresholds) {
        write(&self.config).thresholds = thresholds;
    }

    pub fn set_custom_threshold(&self, metric: impl Into<String>, threshold: f64) {
        write(&self.config)
            .thresholds
            .custom
            .insert(metric.into(), threshold);
    }

    fn buffer(&self, service: &str) -> Arc<Mutex<SlidingWindow<MetricSample>>> {
        if let Some(b) = read(&self.buffers).get(service) {
            return Arc::clone(b);
        }
        let size = read(&self.config).buffer_size;
        let mut buffers = write(&self.buffers);
        Arc::clone(
            buffers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SlidingWindow::new(size)))),
        )
    }

    pub fn record_metric(
        &self,
        service: &str,
        operation: Option<&str>,
        name: &str,
        value: f64,
    ) {
        if !value.is_finite() {
            debug!(service, metric = name, "non-finite metric sample dropped");
            return;
        }
        let sample = MetricSample {
            name: name.to_string(),
            value,
            service: service.to_string(),
            operation: operation.map(str::to_string),
            timestamp: now_ms(),
        };
        lock(&self.buffer(service)).push(sample);
    }

    pub fn record_request(&self, service: &str, operation: &str, duration: Duration, success: bool) {
        let buffer = self.buffer(service);
        let timestamp = now_ms();
        let mut b = lock(&buffer);
        b.push(MetricSample {
            name: LATENCY_METRIC.to_string(),
            value: millis_f64(duration),
            service: service.to_string(),
            operation: Some(operation.to_string()),
            timestamp,
        });
        b.push(MetricSample {
            name: ERROR_METRIC.to_string(),
            value: if success { 0.0 } else { 1.0 },
            service: service.to_string(),
            operation: Some(operation.to_string()),
            timestamp,
        });
    }

    pub fn services(&self) -> Vec<String> {
        let mut out: Vec<_> = read(&self.buffers).keys().cloned().collect();
        out.sort();
        out
    }

    pub fn samples(&self, service: &str) -> Vec<MetricSample> {
        read(&self.buffers)
            .get(service)
            .map(|b| lock(b).iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reset(&self, service: &str) -> bool {
        write(&self.buffers).remove(service).is_some()
    }

    pub fn analyze_service(&self, service: &str) -> Option<ServiceAnalysis> {
        let samples: Vec<MetricSample> = {
            let buffers = read(&self.buffers);
            let buffer = buffers.get(service)?;
            let guard = lock(buffer);
            guard.iter().cloned().collect()
        };
        let config = read(&self.config).clone();
        Some(analyze(service, &samples, &config))
    }

    pub fn report(&self) -> PerformanceReport {
        let services: Vec<ServiceAnalysis> = self
            .services()
            .iter()
            .filter_map(|s| self.analyze_service(s))
            .collect();
        let total_requests: usize = services.iter().map(|s| s.request_count).sum();
        let weighted = |f: fn(&ServiceAnalysis) -> f64| {
            if total_requests == 0 {
                0.0
            } else {
                services
                    .iter()
                    .map(|s| f(s) * s.request_count as f64)
                    .sum::<f64>()
                    / total_requests as f64
            }
        };
        let mut bottlenecks: Vec<Bottleneck> = services
            .iter()
            .flat_map(|s| s.bottlenecks.iter().cloned())
            .collect();
        bottlenecks.sort_by(|a, b| b.severity.cmp(&a.severity));
        PerformanceReport {
            generated_at: now_ms(),
            total_requests,
            overall_error_rate: weighted(|s| s.error_rate),
            avg_latency_ms: weighted(|s| s.avg_latency_ms),
            services,
            bottlenecks,
        }
    }
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn analyze(service: &str, samples: &[MetricSample], config: &AnalyzerConfig) -> ServiceAnalysis {
    let thresholds = &config.thresholds;
    let mut latencies = Vec::new();
    let mut errors = Vec::new();
    let mut custom: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut ops: BTreeMap<String, OpAccumulator> = BTreeMap::new();
    let window_start = now_ms().saturating_sub(config.throughput_window.as_millis() as u64);
    let mut recent_requests = 0usize;

    for s in samples {
        match s.name.as_str() {
            LATENCY_METRIC => {
                latencies.push(s.value);
                if let Some(op) = &s.operation {
                    ops.entry(op.clone()).or_default().latencies.push(s.value);
                }
            }
            ERROR_METRIC => {
                errors.push(s.value);
                if s.timestamp >= window_start {
                    recent_requests += 1;
                }
                if let Some(op) = &s.operation {
                    let acc = ops.entry(op.clone()).or_default();
                    acc.requests += 1;
                    if s.value > 0.0 {
                        acc.errors += 1;
                    }
                }
            }
            other => custom.entry(other.to_string()).or_default().push(s.value),
        }
    }

    let latencies = sorted(latencies);
    let avg_latency = mean(&latencies);
    let p95 = percentile(&latencies, 95.0);
    let error_rate = mean(&errors);
    let window_secs = config.throughput_window.as_secs_f64();

    let operations: Vec<OperationStats> = ops
        .into_iter()
        .map(|(operation, acc)| {
            let lat = sorted(acc.latencies);
            OperationStats {
                error_rate: if acc.requests == 0 {
                    0.0
                } else {
                    acc.errors as f64 / acc.requests as f64
                },
                avg_latency_ms: mean(&lat),
                p95_latency_ms: percentile(&lat, 95.0),
                requests: acc.requests,
                errors: acc.errors,
                operation,
            }
        })
        .collect();
    let custom_metrics: BTreeMap<String, f64> =
        custom.into_iter().map(|(k, v)| (k, mean(&v))).collect();

    let flag = |operation: Option<&str>,
                kind: BottleneckKind,
                metric: &str,
                value: f64,
                threshold: f64,
                recommendation: String| Bottleneck {
        service: service.to_string(),
        operation: operation.map(str::to_string),
        kind,
        metric: metric.to_string(),
        value,
        threshold,
        severity: Severity::from_ratio(if threshold > 0.0 {
            value / threshold
        } else {
            f64::INFINITY
        }),
        recommendation,
    };

    let mut bottlenecks = Vec::new();
    if !latencies.is_empty() && avg_latency > thresholds.latency_ms {
        bottlenecks.push(flag(
            None,
            BottleneckKind::Latency,
            LATENCY_METRIC,
            avg_latency,
            thresholds.latency_ms,
            "Average latency is above target; profile the slowest operations and consider caching"
                .to_string(),
        ));
    }
    if !latencies.is_empty() && p95 > thresholds.p95_latency_ms {
        bottlenecks.push(flag(
            None,
            BottleneckKind::P95Latency,
            "p95_latency",
            p95,
            thresholds.p95_latency_ms,
            "Tail latency is high; look for slow dependencies or lock contention".to_string(),
        ));
    }
    if errors.len() >= thresholds.min_requests && error_rate > thresholds.error_rate {
        bottlenecks.push(flag(
            None,
            BottleneckKind::ErrorRate,
            ERROR_METRIC,
            error_rate,
            thresholds.error_rate,
            "Error rate is above target; inspect recent failures and the circuit state".to_string(),
        ));
    }
    for op in &operations {
        if op.requests > 0 && op.avg_latency_ms > thresholds.latency_ms {
            bottlenecks.push(flag(
                Some(&op.operation),
                BottleneckKind::Latency,
                LATENCY_METRIC,
                op.avg_latency_ms,
                thresholds.latency_ms,
                format!("Operation '{}' is slow; consider batching or caching its results", op.operation),
            ));
        }
    }
    for (metric, value) in &custom_metrics {
        if let Some(threshold) = thresholds.custom.get(metric) {
            if value > threshold {
                bottlenecks.push(flag(
                    None,
                    BottleneckKind::Custom,
                    metric,
                    *value,
                    *threshold,
                    format!("Metric '{}' is above its configured threshold", metric),
                ));
            }
        }
    }
    bottlenecks.sort_by(|a, b| b.severity.cmp(&a.severity));

    ServiceAnalysis {
        service: service.to_string(),
        sample_count: samples.len(),
        request_count: errors.len(),
        avg_latency_ms: avg_latency,
        p50_latency_ms: percentile(&latencies, 50.0),
        p95_latency_ms: p95,
        p99_latency_ms: percentile(&latencies, 99.0),
        throughput_per_sec: if window_secs > 0.0 {
            recent_requests as f64 / window_secs
        } else {
            0.0
        },
        error_rate,
        operations,
        custom_metrics,
        bottlenecks,
        analyzed_at: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_percentiles_over_known_latencies() {
        let analyzer = PerformanceAnalyzer::default();
        for v in 1..=100u64 {
            analyzer.record_request("api", "get", ms(v), true);
        }
        let a = analyzer.analyze_service("api").unwrap();
        assert_eq!(a.request_count, 100);
        assert_eq!(a.p50_latency_ms, 50.0);
        assert_eq!(a.p95_latency_ms, 95.0);
        assert_eq!(a.p99_latency_ms, 99.0);
        assert!((a.avg_latency_ms - 50.5).abs() < 1e-9);
        assert_eq!(a.error_rate, 0.0);
        assert!(a.bottlenecks.is_empty());
        assert!(a.throughput_per_sec > 0.0);
    }

    #[test]
    fn test_latency_and_error_bottlenecks() {
        let analyzer = PerformanceAnalyzer::default();
        for i in 0..10 {
            analyzer.record_request("slow", "query", ms(3500), i % 2 == 0);
        }
        let a = analyzer.analyze_service("slow").unwrap();
        assert_eq!(a.error_rate, 0.5);
        let kinds: Vec<_> = a.bottlenecks.iter().map(|b| b.kind).collect();
        assert!(kinds.contains(&BottleneckKind::Latency));
        assert!(kinds.contains(&BottleneckKind::P95Latency));
        assert!(kinds.contains(&BottleneckKind::ErrorRate));
        // 0.5 / 0.05 is a 10x overshoot.
        let err = a
            .bottlenecks
            .iter()
            .find(|b| b.kind == BottleneckKind::ErrorRate)
            .unwrap();
        assert_eq!(err.severity, Severity::Critical);
        assert!(!err.recommendation.is_empty());
        assert_eq!(a.bottlenecks[0].severity, Severity::Critical);
    }

    #[test]
    fn test_error_rate_needs_min_requests() {
        let analyzer = PerformanceAnalyzer::default();
        analyzer.record_request("api", "get", ms(5), false);
        let a = analyzer.analyze_service("api").unwrap();
        assert_eq!(a.error_rate, 1.0);
        assert!(a.bottlenecks.is_empty());
    }

    #[test]
    fn test_per_operation_breakdown() {
        let analyzer = PerformanceAnalyzer::default();
        analyzer.record_request("api", "fast", ms(10), true);
        analyzer.record_request("api", "fast", ms(20), false);
        analyzer.record_request("api", "slow", ms(1500), true);
        let a = analyzer.analyze_service("api").unwrap();
        assert_eq!(a.operations.len(), 2);
        let fast = &a.operations[0];
        assert_eq!(fast.operation, "fast");
        assert_eq!(fast.requests, 2);
        assert_eq!(fast.error_rate, 0.5);
        assert!((fast.avg_latency_ms - 15.0).abs() < 1e-9);
        assert!(a
            .bottlenecks
            .iter()
            .any(|b| b.operation.as_deref() == Some("slow")));
    }

    #[test]
    fn test_custom_metric_threshold() {
        let analyzer = PerformanceAnalyzer::default();
        analyzer.set_custom_threshold("queue_depth", 10.0);
        analyzer.record_metric("worker", None, "queue_depth", 25.0);
        analyzer.record_metric("worker", None, "queue_depth", 35.0);
        analyzer.record_metric("worker", None, "queue_depth", f64::NAN);
        let a = analyzer.analyze_service("worker").unwrap();
        assert_eq!(a.sample_count, 2);
        assert_eq!(a.custom_metrics["queue_depth"], 30.0);
        assert_eq!(a.bottlenecks.len(), 1);
        assert_eq!(a.bottlenecks[0].kind, BottleneckKind::Custom);
        assert_eq!(a.bottlenecks[0].severity, Severity::Critical);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let analyzer = PerformanceAnalyzer::new(AnalyzerConfig {
            buffer_size: 10,
            ..AnalyzerConfig::default()
        });
        for _ in 0..20 {
            analyzer.record_request("api", "get", ms(1), true);
        }
        assert_eq!(analyzer.samples("api").len(), 10);
    }

    #[test]
    fn test_report_aggregates() {
        let analyzer = PerformanceAnalyzer::default();
        for _ in 0..3 {
            analyzer.record_request("a", "x", ms(10), true);
        }
        analyzer.record_request("b", "y", ms(50), false);
        let report = analyzer.report();
        assert_eq!(report.services.len(), 2);
        assert_eq!(report.total_requests, 4);
        assert!((report.overall_error_rate - 0.25).abs() < 1e-9);
        assert!((report.avg_latency_ms - 20.0).abs() < 1e-9);
        assert!(analyzer.analyze_service("missing").is_none());
        assert!(analyzer.reset("a"));
        assert_eq!(analyzer.services(), vec!["b"]);
    }
}
