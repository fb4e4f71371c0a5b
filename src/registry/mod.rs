//! Service registry: which services exist, how critical they are, how to probe them, and
//! running request/failure totals.

use crate::utils::{millis_f64, now_ms, read, write};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Caller-supplied liveness probe for a registered service.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<()>;
}

/// Adapter turning an async closure into a [`HealthCheck`].
pub struct FnHealthCheck<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn check(&self) -> Result<()> {
        (self.f)().await
    }
}

pub fn health_check_fn<F, Fut>(f: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHealthCheck { f })
}

/// Registration input.
#[derive(Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub criticality: Criticality,
    pub dependencies: Vec<String>,
    pub health_check: Option<Arc<dyn HealthCheck>>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            criticality: Criticality::default(),
            dependencies: Vec::new(),
            health_check: None,
        }
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("name", &self.name)
            .field("criticality", &self.criticality)
            .field("dependencies", &self.dependencies)
            .field("health_check", &self.health_check.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    /// Epoch milliseconds.
    pub checked_at: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Read-only view of a registered service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub criticality: Criticality,
    pub dependencies: Vec<String>,
    pub has_health_check: bool,
    pub registered_at: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub last_request_at: Option<u64>,
    pub health_checks_run: u64,
    pub health_checks_passed: u64,
    pub consecutive_health_failures: u32,
    /// Share of passed health checks; 1.0 when none ran yet.
    pub uptime: f64,
    pub last_health_check: Option<HealthCheckResult>,
}

struct ServiceRecord {
    config: ServiceConfig,
    registered_at: u64,
    total_requests: u64,
    total_failures: u64,
    total_latency_ms: f64,
    last_request_at: Option<u64>,
    health_checks_run: u64,
    health_checks_passed: u64,
    consecutive_health_failures: u32,
    last_health: Option<HealthCheckResult>,
}

impl ServiceRecord {
    fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            registered_at: now_ms(),
            total_requests: 0,
            total_failures: 0,
            total_latency_ms: 0.0,
            last_request_at: None,
            health_checks_run: 0,
            health_checks_passed: 0,
            consecutive_health_failures: 0,
            last_health: None,
        }
    }

    fn descriptor(&self) -> ServiceDescriptor {
        let ratio = |num: u64, den: u64, empty: f64| {
            if den == 0 {
                empty
            } else {
                num as f64 / den as f64
            }
        };
        ServiceDescriptor {
            name: self.config.name.clone(),
            criticality: self.config.criticality,
            dependencies: self.config.dependencies.clone(),
            has_health_check: self.config.health_check.is_some(),
            registered_at: self.registered_at,
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            error_rate: ratio(self.total_failures, self.total_requests, 0.0),
            avg_latency_ms: if self.total_requests == 0 {
                0.0
            } else {
                self.total_latency_ms / self.total_requests as f64
            },
            last_request_at: self.last_request_at,
            health_checks_run: self.health_checks_run,
            health_checks_passed: self.health_checks_passed,
            consecutive_health_failures: self.consecutive_health_failures,
            uptime: ratio(self.health_checks_passed, self.health_checks_run, 1.0),
            last_health_check: self.last_health.clone(),
        }
    }
}

pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceRecord>>,
    health_check_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(health_check_timeout: Duration) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            health_check_timeout,
        }
    }

    /// Registers a service. Re-registering replaces the config and keeps the counters.
    pub fn register(&self, config: ServiceConfig) -> Result<()> {
        let name = config.name.trim();
        if name.is_empty() {
            return Err(Error::validation_with_context(
                "service name must not be empty",
                ErrorContext::new()
                    .with_field_path("service.name")
                    .with_source("service_registry"),
            ));
        }
        if config.dependencies.iter().any(|d| d == name) {
            return Err(Error::validation_with_context(
                format!("service '{}' cannot depend on itself", name),
                ErrorContext::new()
                    .with_field_path("service.dependencies")
                    .with_source("service_registry"),
            ));
        }
        let name = name.to_string();
        let mut services = write(&self.services);
        match services.get_mut(&name) {
            Some(existing) => {
                warn!(service = %name, "service re-registered; replacing configuration");
                existing.config = config;
            }
            None => {
                info!(
                    service = %name,
                    criticality = config.criticality.as_str(),
                    dependencies = config.dependencies.len(),
                    "service registered"
                );
                services.insert(name, ServiceRecord::new(config));
            }
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = write(&self.services).remove(name).is_some();
        if removed {
            info!(service = name, "service unregistered");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.services).contains_key(name)
    }

    pub fn len(&self) -> usize {
        read(&self.services).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = read(&self.services).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<ServiceDescriptor> {
        read(&self.services).get(name).map(ServiceRecord::descriptor)
    }

    pub fn list(&self) -> Vec<ServiceDescriptor> {
        let mut out: Vec<_> = read(&self.services)
            .values()
            .map(ServiceRecord::descriptor)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn criticality(&self, name: &str) -> Option<Criticality> {
        read(&self.services).get(name).map(|r| r.config.criticality)
    }

    /// Services that list `name` as a dependency.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut out: Vec<_> = read(&self.services)
            .values()
            .filter(|r| r.config.dependencies.iter().any(|d| d == name))
            .map(|r| r.config.name.clone())
            .collect();
        out.sort();
        out
    }

    /// `(service, dependency)` pairs whose dependency is not registered.
    pub fn missing_dependencies(&self) -> Vec<(String, String)> {
        let services = read(&self.services);
        let mut out: Vec<_> = services
            .values()
            .flat_map(|r| {
                r.config
                    .dependencies
                    .iter()
                    .filter(|d| !services.contains_key(d.as_str()))
                    .map(|d| (r.config.name.clone(), d.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort();
        out
    }

    /// Adds one request outcome to the running totals. Returns false for unknown services.
    pub fn record_request(&self, name: &str, success: bool, duration: Duration) -> bool {
        let mut services = write(&self.services);
        match services.get_mut(name) {
            Some(r) => {
                r.total_requests += 1;
                if !success {
                    r.total_failures += 1;
                }
                r.total_latency_ms += millis_f64(duration);
                r.last_request_at = Some(now_ms());
                true
            }
            None => {
                debug!(service = name, "request recorded for unregistered service");
                false
            }
        }
    }

    /// Runs the service's health check under the registry timeout and records the result.
    ///
    /// Services without a callback are reported healthy without being counted.
    pub async fn check_health(&self, name: &str) -> Result<HealthCheckResult> {
        let check = read(&self.services)
            .get(name)
            .map(|r| r.config.health_check.clone())
            .ok_or_else(|| Error::not_found("service", name))?;
        let Some(check) = check else {
            return Ok(HealthCheckResult {
                healthy: true,
                checked_at: now_ms(),
                duration_ms: 0,
                error: None,
            });
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.health_check_timeout, check.check()).await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "health check timed out after {}ms",
                self.health_check_timeout.as_millis()
            )),
        };
        let result = HealthCheckResult {
            healthy: error.is_none(),
            checked_at: now_ms(),
            duration_ms: start.elapsed().as_millis() as u64,
            error,
        };

        if let Some(r) = write(&self.services).get_mut(name) {
            r.health_checks_run += 1;
            if result.healthy {
                r.health_checks_passed += 1;
                r.consecutive_health_failures = 0;
            } else {
                r.consecutive_health_failures += 1;
                warn!(
                    service = name,
                    consecutive_failures = r.consecutive_health_failures,
                    error = result.error.as_deref().unwrap_or_default(),
                    "health check failed"
                );
            }
            r.last_health = Some(result.clone());
        }
        Ok(result)
    }

    /// Runs every registered health check concurrently.
    pub async fn check_all(&self) -> HashMap<String, HealthCheckResult> {
        let names = self.names();
        let checks = names.iter().map(|name| async move {
            let result = self.check_health(name).await;
            (name.clone(), result)
        });
        futures::future::join_all(checks)
            .await
            .into_iter()
            .filter_map(|(name, r)| r.ok().map(|r| (name, r)))
            .collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_register_and_lookup() {
        let registry = ServiceRegistry::default();
        registry
            .register(
                ServiceConfig::new("orders")
                    .with_criticality(Criticality::Critical)
                    .with_dependencies(["db", "cache"]),
            )
            .unwrap();
        let d = registry.get("orders").unwrap();
        assert_eq!(d.criticality, Criticality::Critical);
        assert_eq!(d.dependencies, vec!["db", "cache"]);
        assert!(!d.has_health_check);
        assert_eq!(d.uptime, 1.0);
        assert_eq!(
            registry.missing_dependencies(),
            vec![
                ("orders".to_string(), "cache".to_string()),
                ("orders".to_string(), "db".to_string())
            ]
        );
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let registry = ServiceRegistry::default();
        assert!(registry.register(ServiceConfig::new("  ")).is_err());
        assert!(registry
            .register(ServiceConfig::new("loop").with_dependency("loop"))
            .is_err());
    }

    #[test]
    fn test_reregister_keeps_counters() {
        let registry = ServiceRegistry::default();
        registry.register(ServiceConfig::new("a")).unwrap();
        registry.record_request("a", true, Duration::from_millis(10));
        registry
            .register(ServiceConfig::new("a").with_criticality(Criticality::Low))
            .unwrap();
        let d = registry.get("a").unwrap();
        assert_eq!(d.total_requests, 1);
        assert_eq!(d.criticality, Criticality::Low);
    }

    #[test]
    fn test_record_request_totals() {
        let registry = ServiceRegistry::default();
        registry.register(ServiceConfig::new("a")).unwrap();
        registry.record_request("a", true, Duration::from_millis(10));
        registry.record_request("a", false, Duration::from_millis(30));
        assert!(!registry.record_request("ghost", true, Duration::ZERO));
        let d = registry.get("a").unwrap();
        assert_eq!(d.total_requests, 2);
        assert_eq!(d.total_failures, 1);
        assert_eq!(d.error_rate, 0.5);
        assert!((d.avg_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_unregister_and_dependents() {
        let registry = ServiceRegistry::default();
        registry.register(ServiceConfig::new("db")).unwrap();
        registry
            .register(ServiceConfig::new("api").with_dependency("db"))
            .unwrap();
        assert_eq!(registry.dependents_of("db"), vec!["api"]);
        assert!(registry.unregister("db"));
        assert!(!registry.unregister("db"));
        assert_eq!(registry.names(), vec!["api"]);
    }

    #[tokio::test]
    async fn test_health_check_tracks_uptime() {
        let registry = ServiceRegistry::default();
        let up = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&up);
        registry
            .register(ServiceConfig::new("db").with_health_check(health_check_fn(move || {
                let healthy = flag.load(Ordering::SeqCst);
                async move {
                    if healthy {
                        Ok(())
                    } else {
                        Err(Error::transient("connection refused"))
                    }
                }
            })))
            .unwrap();

        assert!(registry.check_health("db").await.unwrap().healthy);
        up.store(false, Ordering::SeqCst);
        let failed = registry.check_health("db").await.unwrap();
        assert!(!failed.healthy);
        assert!(failed.error.unwrap().contains("connection refused"));

        let d = registry.get("db").unwrap();
        assert_eq!(d.health_checks_run, 2);
        assert_eq!(d.uptime, 0.5);
        assert_eq!(d.consecutive_health_failures, 1);
    }

    #[tokio::test]
    async fn test_health_check_timeout() {
        let registry = ServiceRegistry::new(Duration::from_millis(20));
        registry
            .register(ServiceConfig::new("slow").with_health_check(health_check_fn(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })))
            .unwrap();
        let result = registry.check_health("slow").await.unwrap();
        assert!(!result.healthy);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_check_all_and_unknown() {
        let registry = ServiceRegistry::default();
        registry.register(ServiceConfig::new("a")).unwrap();
        registry.register(ServiceConfig::new("b")).unwrap();
        let results = registry.check_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| r.healthy));
        assert!(matches!(
            registry.check_health("nope").await,
            Err(Error::NotFound { .. })
        ));
    }
}
