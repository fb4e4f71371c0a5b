//! Request context tracking: spans, trace trees and latency history.
//!
//! Every request gets a fresh id and span id. Child requests inherit the parent's trace id,
//! so a whole call tree can be fetched with [`RequestContextManager::get_trace`].
//!
//! ```rust
//! use backend_orchestrator::context::{RequestContextManager, StartOptions};
//!
//! let contexts = RequestContextManager::default();
//! let root = contexts.start_request(StartOptions::new("api", "checkout"));
//! let child = contexts.start_request(StartOptions::new("payments", "charge").with_parent(&root.id));
//! assert_eq!(root.trace_id, child.trace_id);
//!
//! contexts.end_request(&child.id).unwrap();
//! contexts.end_request(&root.id).unwrap();
//! assert_eq!(contexts.get_trace(&root.id).unwrap().node_count(), 2);
//! ```

mod manager;

pub use manager::RequestContextManager;

use crate::utils::{duration_ms, LatencyPercentiles};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identity of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestContext {
    pub id: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_id: Option<String>,
    pub service: String,
    pub operation: String,
    /// Epoch milliseconds.
    pub start_time: u64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Active,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestEntry {
    pub context: RequestContext,
    pub status: RequestStatus,
    pub end_time: Option<u64>,
    /// `end_time - start_time`, once finalized.
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub children: Vec<String>,
}

/// Input to [`RequestContextManager::start_request`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub service: String,
    pub operation: String,
    pub parent_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl StartOptions {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            ..Default::default()
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
}

/// One node of a trace tree. Each entry appears once even when linked from several parents.
#[derive(Debug, Clone, Serialize)]
pub struct TraceNode {
    pub entry: RequestEntry,
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    /// Number of nodes in this subtree, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TraceNode::node_count).sum::<usize>()
    }

    /// Depth-first ids, root first.
    pub fn ids(&self) -> Vec<String> {
        let mut out = vec![self.entry.context.id.clone()];
        for child in &self.children {
            out.extend(child.ids());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Durations kept for percentile math, globally and per service.
    pub history_size: usize,
    /// How long finalized entries are kept.
    #[serde(rename = "retention_ms", with = "duration_ms")]
    pub retention: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            retention: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextStats {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub tracked_entries: usize,
    pub error_rate: f64,
    pub latency: LatencyPercentiles,
    pub per_service: BTreeMap<String, LatencyPercentiles>,
}
