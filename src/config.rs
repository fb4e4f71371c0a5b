//! Configuration loaded from YAML or JSON.
//!
//! Durations are millisecond integers (`timeout_ms`, `reset_timeout_ms`, ...). Every section is
//! optional; missing fields take their defaults.
//!
//! ```rust
//! use backend_orchestrator::config::BackendConfig;
//!
//! let cfg = BackendConfig::from_yaml_str(r#"
//! services:
//!   - name: payments
//!     criticality: critical
//!     dependencies: [ledger]
//!     circuit:
//!       failure_threshold: 3
//!       reset_timeout_ms: 10000
//!     rate_limit:
//!       max_tokens: 20
//!       refill_rate: 5
//!   - name: ledger
//! queue:
//!   max_size: 500
//! "#).unwrap();
//! assert_eq!(cfg.services.len(), 2);
//! assert_eq!(cfg.services[0].circuit.as_ref().unwrap().failure_threshold, 3);
//! ```

use crate::context::ContextConfig;
use crate::health::HealthConfig;
use crate::performance::AnalyzerConfig;
use crate::queue::QueueConfig;
use crate::registry::{Criticality, ServiceConfig};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use crate::utils::duration_ms;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// One service and its per-service overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueConfig>,
}

impl ServiceEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            criticality: Criticality::default(),
            dependencies: Vec::new(),
            circuit: None,
            rate_limit: None,
            queue: None,
        }
    }

    /// Registry input for this entry. Health checks are code, so they are attached separately.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new(&self.name)
            .with_criticality(self.criticality)
            .with_dependencies(self.dependencies.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub services: Vec<ServiceEntry>,
    /// Circuit settings for services without their own.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Bucket for services without their own; `None` leaves them unlimited.
    pub rate_limit: Option<RateLimitConfig>,
    pub queue: QueueConfig,
    pub health: HealthConfig,
    pub context: ContextConfig,
    pub analyzer: AnalyzerConfig,
    /// Check the rate limiter before every `execute`.
    pub enforce_rate_limits: bool,
    /// How long shutdown waits for queued work.
    #[serde(rename = "drain_timeout_ms", with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
            context: ContextConfig::default(),
            analyzer: AnalyzerConfig::default(),
            enforce_rate_limits: true,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

fn parse_error(format: &str, e: impl std::fmt::Display) -> Error {
    Error::configuration_with_context(
        format!("invalid {} configuration: {}", format, e),
        ErrorContext::new().with_source("config"),
    )
}

/// Prefixes the field path of a component validation error with its location in the file.
fn scoped(err: Error, prefix: &str) -> Error {
    match err {
        Error::Configuration { message, context } | Error::Validation { message, context } => {
            let path = match &context.field_path {
                Some(p) => format!("{}.{}", prefix, p),
                None => prefix.to_string(),
            };
            Error::configuration_with_context(
                message,
                ErrorContext {
                    field_path: Some(path),
                    ..context
                },
            )
        }
        other => other,
    }
}

impl BackendConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| parse_error("YAML", e))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| parse_error("JSON", e))
    }

    /// Loads a file, picking the format from its extension (`.json`, otherwise YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read {}: {}", path.display(), e),
                ErrorContext::new().with_source("config"),
            )
        })?;
        let is_json = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("json"));
        let cfg = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker
            .validate()
            .map_err(|e| scoped(e, "circuit_breaker"))?;
        if let Some(rl) = &self.rate_limit {
            rl.validate().map_err(|e| scoped(e, "rate_limit"))?;
        }
        self.queue.validate().map_err(|e| scoped(e, "queue"))?;
        self.health
            .thresholds
            .validate()
            .map_err(|e| scoped(e, "health"))?;
        if self.health.check_interval.is_zero() {
            return Err(Error::configuration_with_context(
                "health check interval must be positive",
                ErrorContext::new()
                    .with_field_path("health.check_interval_ms")
                    .with_source("config"),
            ));
        }

        let mut seen = HashSet::new();
        for (i, svc) in self.services.iter().enumerate() {
            let prefix = format!("services[{}]", i);
            if svc.name.trim().is_empty() {
                return Err(Error::configuration_with_context(
                    "service name must not be empty",
                    ErrorContext::new()
                        .with_field_path(format!("{}.name", prefix))
                        .with_source("config"),
                ));
            }
            if !seen.insert(svc.name.as_str()) {
                return Err(Error::configuration_with_context(
                    format!("duplicate service '{}'", svc.name),
                    ErrorContext::new()
                        .with_field_path(format!("{}.name", prefix))
                        .with_source("config"),
                ));
            }
            if svc.dependencies.iter().any(|d| d == &svc.name) {
                return Err(Error::configuration_with_context(
                    format!("service '{}' cannot depend on itself", svc.name),
                    ErrorContext::new()
                        .with_field_path(format!("{}.dependencies", prefix))
                        .with_source("config"),
                ));
            }
            if let Some(c) = &svc.circuit {
                c.validate().map_err(|e| scoped(e, &prefix))?;
            }
            if let Some(r) = &svc.rate_limit {
                r.validate().map_err(|e| scoped(e, &prefix))?;
            }
            if let Some(q) = &svc.queue {
                q.validate().map_err(|e| scoped(e, &prefix))?;
            }
        }
        Ok(())
    }

    /// Non-fatal findings, such as dependencies on services not listed in the file.
    pub fn warnings(&self) -> Vec<String> {
        let names: HashSet<&str> = self.services.iter().map(|s| s.name.as_str()).collect();
        let mut out = Vec::new();
        for svc in &self.services {
            for dep in &svc.dependencies {
                if !names.contains(dep.as_str()) {
                    out.push(format!(
                        "service '{}' depends on '{}', which is not configured",
                        svc.name, dep
                    ));
                }
            }
        }
        if !self.enforce_rate_limits
            && (self.rate_limit.is_some() || self.services.iter().any(|s| s.rate_limit.is_some()))
        {
            out.push("rate limits are configured but enforce_rate_limits is false".to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let cfg = BackendConfig::from_yaml_str("{}").unwrap();
        assert_eq!(cfg, BackendConfig::default());
        assert!(cfg.enforce_rate_limits);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_json_and_yaml_agree() {
        let yaml = BackendConfig::from_yaml_str(
            "services:\n  - name: a\n    criticality: high\ndrain_timeout_ms: 500\n",
        )
        .unwrap();
        let json = BackendConfig::from_json_str(
            r#"{"services":[{"name":"a","criticality":"high"}],"drain_timeout_ms":500}"#,
        )
        .unwrap();
        assert_eq!(yaml, json);
        assert_eq!(yaml.drain_timeout, Duration::from_millis(500));
        assert_eq!(yaml.services[0].criticality, Criticality::High);
    }

    #[test]
    fn test_parse_error_is_configuration() {
        let err = BackendConfig::from_yaml_str("services: 7").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_validation_paths() {
        let mut cfg = BackendConfig::default();
        cfg.services.push(ServiceEntry {
            circuit: Some(CircuitBreakerConfig::new().with_failure_threshold(0)),
            ..ServiceEntry::new("a")
        });
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("services[0].circuit.failure_threshold")
        );

        let mut dup = BackendConfig::default();
        dup.services.push(ServiceEntry::new("a"));
        dup.services.push(ServiceEntry::new("a"));
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_warnings_for_unknown_dependencies() {
        let mut cfg = BackendConfig::default();
        let mut entry = ServiceEntry::new("api");
        entry.dependencies.push("db".into());
        cfg.services.push(entry);
        let warnings = cfg.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'db'"));
    }

    #[test]
    fn test_from_file_picks_format() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("backend-orchestrator-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"services":[{"name":"x"}]}"#).unwrap();
        let cfg = BackendConfig::from_file(&path).unwrap();
        assert_eq!(cfg.services[0].name, "x");
        std::fs::remove_file(&path).unwrap();
        assert!(BackendConfig::from_file(dir.join("does-not-exist.yaml")).is_err());
    }
}
