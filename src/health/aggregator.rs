use super::score::{self, Deductions};
use super::{
    Alert, AlertSeverity, HealthConfig, HealthReport, HealthStatus, ServiceHealth,
    ServiceMetrics, TrendDirection,
};
use crate::events::{BackendEvent, EventBus, Subscription};
use crate::performance::PerformanceAnalyzer;
use crate::registry::{ServiceDescriptor, ServiceRegistry};
use crate::resilience::{CircuitBreakerCoordinator, CircuitState, RateLimiter};
use crate::utils::background::Background;
use crate::utils::{lock, now_ms, SlidingWindow};
use crate::Result;
use arc_swap::ArcSwap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RATE_LIMIT_PRESSURE: f64 = 0.9;

struct AggregatorState {
    history: HashMap<String, SlidingWindow<f64>>,
    overall_history: SlidingWindow<f64>,
    last_status: HashMap<String, HealthStatus>,
    alerts: VecDeque<Alert>,
}

pub struct HealthAggregator {
    config: HealthConfig,
    registry: Arc<ServiceRegistry>,
    analyzer: Arc<PerformanceAnalyzer>,
    circuits: Arc<CircuitBreakerCoordinator>,
    limiter: Arc<RateLimiter>,
    state: Mutex<AggregatorState>,
    report: ArcSwap<HealthReport>,
    events: EventBus,
    background: Background,
}

impl HealthAggregator {
    pub fn new(
        config: HealthConfig,
        registry: Arc<ServiceRegistry>,
        analyzer: Arc<PerformanceAnalyzer>,
        circuits: Arc<CircuitBreakerCoordinator>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let history_len = config.trend_window.max(1) * 2;
        Self {
            config,
            registry,
            analyzer,
            circuits,
            limiter,
            state: Mutex::new(AggregatorState {
                history: HashMap::new(),
                overall_history: SlidingWindow::new(history_len),
                last_status: HashMap::new(),
                alerts: VecDeque::new(),
            }),
            report: ArcSwap::from_pointee(HealthReport::empty()),
            events: EventBus::new("health"),
            background: Background::new("health"),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
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

    /// Latest published report. Empty until the first evaluation.
    pub fn latest(&self) -> Arc<HealthReport> {
        self.report.load_full()
    }

    fn metrics_for(&self, descriptor: &ServiceDescriptor) -> ServiceMetrics {
        let analysis = self.analyzer.analyze_service(&descriptor.name);
        let (latency_ms, error_rate, request_count) = match analysis {
            Some(a) if a.request_count > 0 => (a.avg_latency_ms, a.error_rate, a.request_count),
            _ => (
                descriptor.avg_latency_ms,
                descriptor.error_rate,
                descriptor.total_requests as usize,
            ),
        };
        ServiceMetrics {
            latency_ms,
            error_rate,
            uptime: descriptor.uptime,
            request_count,
            circuit_state: self.circuits.state(&descriptor.name),
            health_check_passing: descriptor.last_health_check.as_ref().map(|h| h.healthy),
            rate_limit_utilization: self.limiter.snapshot(&descriptor.name).map(|s| s.utilization),
        }
    }

    fn recommendations(
        &self,
        metrics: &ServiceMetrics,
        deductions: &Deductions,
        descriptor: &ServiceDescriptor,
    ) -> Vec<String> {
        let mut out = Vec::new();
        if deductions.latency > 0.0 {
            out.push(format!(
                "Average latency {:.0}ms is above the healthy target; profile slow operations",
                metrics.latency_ms
            ));
        }
        if deductions.error_rate > 0.0 {
            out.push(format!(
                "Error rate {:.1}% is above the healthy target; inspect recent failures",
                metrics.error_rate * 100.0
            ));
        }
        if deductions.uptime > 0.0 {
            out.push("Health checks are failing intermittently; check the dependency".to_string());
        }
        match metrics.circuit_state {
            Some(CircuitState::Open) => {
                out.push("Circuit breaker is open; requests are being rejected".to_string())
            }
            Some(CircuitState::HalfOpen) => {
                out.push("Circuit breaker is probing recovery".to_string())
            }
            _ => {}
        }
        if metrics.health_check_passing == Some(false) {
            let reason = descriptor
                .last_health_check
                .as_ref()
                .and_then(|h| h.error.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            out.push(format!("Health check failing: {}", reason));
        }
        if metrics
            .rate_limit_utilization
            .is_some_and(|u| u >= RATE_LIMIT_PRESSURE)
        {
            out.push("Rate limit bucket is nearly exhausted; consider raising capacity".to_string());
        }
        out
    }

    /// Issues that warrant an alert. Messages carry no live values so deduplication works.
    fn alert_candidates(health: &ServiceHealth) -> Vec<(AlertSeverity, String)> {
        let mut out = Vec::new();
        match health.status {
            HealthStatus::Critical => out.push((AlertSeverity::Critical, "service status critical".to_string())),
            HealthStatus::Unhealthy => out.push((AlertSeverity::Warning, "service status unhealthy".to_string())),
            HealthStatus::Degraded => out.push((AlertSeverity::Info, "service status degraded".to_string())),
            HealthStatus::Healthy => {}
        }
        if health.metrics.circuit_state == Some(CircuitState::Open) {
            out.push((AlertSeverity::Warning, "circuit breaker open".to_string()));
        }
        if health.metrics.health_check_passing == Some(false) {
            out.push((AlertSeverity::Warning, "health check failing".to_string()));
        }
        out
    }

    /// Runs health checks (when enabled), scores every registered service, raises alerts and
    /// publishes the resulting report.
    pub async fn evaluate(&self) -> Arc<HealthReport> {
        if self.config.run_health_checks {
            self.registry.check_all().await;
        }
        let thresholds = &self.config.thresholds;
        let mut services: Vec<ServiceHealth> = self
            .registry
            .list()
            .iter()
            .map(|d| {
                let metrics = self.metrics_for(d);
                let deductions = score::deductions(&metrics, thresholds);
                let value = score::score(&metrics, thresholds);
                let status = score::classify(&metrics, value, thresholds);
                ServiceHealth {
                    service: d.name.clone(),
                    criticality: d.criticality,
                    score: value,
                    status,
                    recommendations: self.recommendations(&metrics, &deductions, d),
                    metrics,
                    deductions,
                    trend: TrendDirection::Stable,
                }
            })
            .collect();

        let pairs: Vec<(f64, HealthStatus)> = services.iter().map(|s| (s.score, s.status)).collect();
        let overall_score = score::overall_score(&pairs);
        let overall_status = score::overall_status(&pairs, overall_score);

        let mut events = Vec::new();
        let (overall_trend, alerts) = {
            let mut state = lock(&self.state);
            let history_len = self.config.trend_window.max(1) * 2;
            let now = now_ms();
            for s in services.iter_mut() {
                let history = state
                    .history
                    .entry(s.service.clone())
                    .or_insert_with(|| SlidingWindow::new(history_len));
                history.push(s.score);
                let scores: Vec<f64> = history.iter().copied().collect();
                s.trend = score::trend(&scores, self.config.trend_window);

                let previous = state.last_status.insert(s.service.clone(), s.status);
                if let Some(from) = previous.filter(|p| *p != s.status) {
                    info!(
                        service = %s.service,
                        from = from.as_str(),
                        to = s.status.as_str(),
                        score = s.score,
                        "service health changed"
                    );
                    events.push(BackendEvent::HealthChanged {
                        service: s.service.clone(),
                        from,
                        to: s.status,
                        score: s.score,
                    });
                }

                for (severity, message) in Self::alert_candidates(s) {
                    if let Some(alert) = self.raise(&mut state.alerts, &s.service, severity, message, now)
                    {
                        events.push(BackendEvent::AlertRaised(alert));
                    }
                }
            }
            let registered: Vec<String> = services.iter().map(|s| s.service.clone()).collect();
            state.history.retain(|k, _| registered.contains(k));
            state.last_status.retain(|k, _| registered.contains(k));

            state.overall_history.push(overall_score);
            let overall: Vec<f64> = state.overall_history.iter().copied().collect();
            let trend = score::trend(&overall, self.config.trend_window);
            let alerts: Vec<Alert> = state.alerts.iter().filter(|a| !a.acknowledged).cloned().collect();
            (trend, alerts)
        };

        let report = Arc::new(HealthReport {
            generated_at: now_ms(),
            overall_score,
            overall_status,
            overall_trend,
            services,
            alerts,
        });
        self.report.store(Arc::clone(&report));
        debug!(
            overall_score,
            overall_status = overall_status.as_str(),
            services = report.services.len(),
            "health evaluated"
        );
        for event in events {
            self.events.emit(event);
        }
        report
    }

    /// Appends an alert unless the same service+message was raised within the dedup window.
    fn raise(
        &self,
        alerts: &mut VecDeque<Alert>,
        service: &str,
        severity: AlertSeverity,
        message: String,
        now: u64,
    ) -> Option<Alert> {
        let window = self.config.alert_dedup_window.as_millis() as u64;
        let duplicate = alerts.iter().rev().any(|a| {
            a.service == service && a.message == message && now.saturating_sub(a.timestamp) < window
        });
        if duplicate {
            return None;
        }
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            service: service.to_string(),
            severity,
            message,
            timestamp: now,
            acknowledged: false,
        };
        warn!(
            service,
            severity = ?alert.severity,
            message = %alert.message,
            "health alert raised"
        );
        alerts.push_back(alert.clone());
        while alerts.len() > self.config.max_alerts.max(1) {
            alerts.pop_front();
        }
        Some(alert)
    }

    /// Alert history, oldest first.
    pub fn alerts(&self, include_acknowledged: bool) -> Vec<Alert> {
        lock(&self.state)
            .alerts
            .iter()
            .filter(|a| include_acknowledged || !a.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let mut state = lock(&self.state);
        match state.alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                debug!(alert_id, service = %alert.service, "alert acknowledged");
                true
            }
            None => false,
        }
    }

    /// Starts the evaluation tick. Returns false if it was already running.
    pub fn start(self: &Arc<Self>) -> Result<bool> {
        let Some(token) = self.background.begin()? else {
            return Ok(false);
        };
        let weak = Arc::downgrade(self);
        self.background.spawn_periodic(
            &token,
            "health_tick",
            self.config.check_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(this) = weak.upgrade() {
                        this.evaluate().await;
                    }
                }
            },
        );
        Ok(true)
    }

    pub async fn stop(&self) -> bool {
        self.background.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.background.is_running()
    }
}
