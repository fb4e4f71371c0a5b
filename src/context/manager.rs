use super::{
    ContextConfig, ContextStats, RequestContext, RequestEntry, RequestStatus, StartOptions,
    TraceNode,
};
use crate::events::{BackendEvent, EventBus, Subscription};
use crate::utils::background::Background;
use crate::utils::{lock, now_ms, short_id, LatencyPercentiles, SlidingWindow};
use crate::{Error, ErrorContext, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

struct Store {
    entries: HashMap<String, RequestEntry>,
    history: SlidingWindow<f64>,
    per_service: HashMap<String, SlidingWindow<f64>>,
    completed: u64,
    failed: u64,
}

pub struct RequestContextManager {
    config: ContextConfig,
    store: Mutex<Store>,
    events: EventBus,
    background: Background,
}

impl RequestContextManager {
    pub fn new(config: ContextConfig) -> Self {
        let history = SlidingWindow::new(config.history_size);
        Self {
            config,
            store: Mutex::new(Store {
                entries: HashMap::new(),
                history,
                per_service: HashMap::new(),
                completed: 0,
                failed: 0,
            }),
            events: EventBus::new("request_context"),
            background: Background::new("request_context"),
        }
    }

    pub fn config(&self) -> &ContextConfig {
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

    /// Opens a new span. An unknown `parent_id` starts a fresh trace.
    pub fn start_request(&self, options: StartOptions) -> RequestContext {
        let id = Uuid::new_v4().to_string();
        let context = {
            let mut store = lock(&self.store);
            let parent = match options.parent_id.as_deref() {
                Some(pid) => {
                    let found = store.entries.get_mut(pid);
                    if found.is_none() {
                        warn!(parent_id = pid, "unknown parent request; starting a new trace");
                    }
                    found
                }
                None => None,
            };
            let (trace_id, parent_id) = match parent {
                Some(p) => {
                    p.children.push(id.clone());
                    (p.context.trace_id.clone(), Some(p.context.id.clone()))
                }
                None => (Uuid::new_v4().to_string(), None),
            };
            let context = RequestContext {
                id: id.clone(),
                trace_id,
                span_id: short_id(),
                parent_id,
                service: options.service,
                operation: options.operation,
                start_time: now_ms(),
                metadata: options.metadata,
            };
            store.entries.insert(
                id,
                RequestEntry {
                    context: context.clone(),
                    status: RequestStatus::Active,
                    end_time: None,
                    duration_ms: None,
                    error: None,
                    children: Vec::new(),
                },
            );
            context
        };

        debug!(
            request_id = %context.id,
            trace_id = %context.trace_id,
            service = %context.service,
            operation = %context.operation,
            "request started"
        );
        self.events.emit(BackendEvent::RequestStarted {
            request_id: context.id.clone(),
            trace_id: context.trace_id.clone(),
            service: context.service.clone(),
            operation: context.operation.clone(),
        });
        context
    }

    pub fn end_request(&self, id: &str) -> Result<RequestEntry> {
        self.finish(id, None)
    }

    pub fn end_request_with_error(&self, id: &str, error: &Error) -> Result<RequestEntry> {
        self.finish(id, Some(error.to_string()))
    }

    fn finish(&self, id: &str, error: Option<String>) -> Result<RequestEntry> {
        let entry = {
            let mut store = lock(&self.store);
            let history_size = self.config.history_size;
            let entry = store
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::not_found("request", id))?;
            if entry.status.is_final() {
                return Err(Error::runtime_with_context(
                    format!("request '{}' already finalized", id),
                    ErrorContext::new()
                        .with_details(format!("status: {:?}", entry.status))
                        .with_source("request_context"),
                ));
            }
            let end_time = now_ms().max(entry.context.start_time);
            let duration = end_time - entry.context.start_time;
            entry.end_time = Some(end_time);
            entry.duration_ms = Some(duration);
            entry.status = if error.is_some() {
                RequestStatus::Failed
            } else {
                RequestStatus::Completed
            };
            entry.error = error;
            let entry = entry.clone();

            if entry.status == RequestStatus::Failed {
                store.failed += 1;
            } else {
                store.completed += 1;
            }
            store.history.push(duration as f64);
            store
                .per_service
                .entry(entry.context.service.clone())
                .or_insert_with(|| SlidingWindow::new(history_size))
                .push(duration as f64);
            entry
        };

        let ctx = &entry.context;
        let duration_ms = entry.duration_ms.unwrap_or_default();
        match &entry.error {
            None => {
                debug!(request_id = %ctx.id, duration_ms, "request completed");
                self.events.emit(BackendEvent::RequestCompleted {
                    request_id: ctx.id.clone(),
                    trace_id: ctx.trace_id.clone(),
                    service: ctx.service.clone(),
                    operation: ctx.operation.clone(),
                    duration_ms,
                });
            }
            Some(err) => {
                debug!(request_id = %ctx.id, duration_ms, error = %err, "request failed");
                self.events.emit(BackendEvent::RequestFailed {
                    request_id: ctx.id.clone(),
                    trace_id: ctx.trace_id.clone(),
                    service: ctx.service.clone(),
                    operation: ctx.operation.clone(),
                    duration_ms,
                    error: err.clone(),
                });
            }
        }
        Ok(entry)
    }

    /// Starts a request, runs `f` with its context and finalizes it from the outcome.
    pub async fn with_context<T, F, Fut>(&self, options: StartOptions, f: F) -> Result<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ctx = self.start_request(options);
        let mut guard = FinalizeOnDrop {
            contexts: self,
            id: Some(ctx.id.clone()),
        };
        let outcome = f(ctx).await;
        let id = guard.disarm();
        match outcome {
            Ok(value) => {
                self.finalize_quietly(self.end_request(&id));
                Ok(value)
            }
            Err(e) => {
                self.finalize_quietly(self.end_request_with_error(&id, &e));
                Err(e)
            }
        }
    }

    // The closure may have finalized the request itself; that is not the caller's error.
    fn finalize_quietly(&self, result: Result<RequestEntry>) {
        if let Err(e) = result {
            debug!(error = %e, "request already finalized inside with_context");
        }
    }

    /// Records an extra parent -> child edge inside one trace.
    pub fn link(&self, parent_id: &str, child_id: &str) -> Result<()> {
        if parent_id == child_id {
            return Err(Error::validation_with_context(
                "a request cannot be linked to itself",
                ErrorContext::new().with_source("request_context"),
            ));
        }
        let mut store = lock(&self.store);
        let child_trace = store
            .entries
            .get(child_id)
            .map(|e| e.context.trace_id.clone())
            .ok_or_else(|| Error::not_found("request", child_id))?;
        let parent = store
            .entries
            .get_mut(parent_id)
            .ok_or_else(|| Error::not_found("request", parent_id))?;
        if parent.context.trace_id != child_trace {
            return Err(Error::validation_with_context(
                "linked requests must share a trace",
                ErrorContext::new()
                    .with_details(format!(
                        "parent trace {} != child trace {}",
                        parent.context.trace_id, child_trace
                    ))
                    .with_source("request_context"),
            ));
        }
        if !parent.children.iter().any(|c| c == child_id) {
            parent.children.push(child_id.to_string());
        }
        Ok(())
    }

    pub fn get_request(&self, id: &str) -> Option<RequestEntry> {
        lock(&self.store).entries.get(id).cloned()
    }

    pub fn active_requests(&self) -> Vec<RequestContext> {
        let mut out: Vec<_> = lock(&self.store)
            .entries
            .values()
            .filter(|e| e.status == RequestStatus::Active)
            .map(|e| e.context.clone())
            .collect();
        out.sort_by_key(|c| c.start_time);
        out
    }

    /// Tree rooted at `id`. Entries reachable through several parents appear once.
    pub fn get_trace(&self, id: &str) -> Option<TraceNode> {
        let store = lock(&self.store);
        let mut visited = HashSet::new();
        build_node(&store.entries, id, &mut visited)
    }

    /// Every tracked entry of a trace, oldest first.
    pub fn trace_entries(&self, trace_id: &str) -> Vec<RequestEntry> {
        let mut out: Vec<_> = lock(&self.store)
            .entries
            .values()
            .filter(|e| e.context.trace_id == trace_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.context.start_time);
        out
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        lock(&self.store).history.percentiles()
    }

    pub fn service_percentiles(&self, service: &str) -> Option<LatencyPercentiles> {
        lock(&self.store)
            .per_service
            .get(service)
            .map(SlidingWindow::percentiles)
    }

    pub fn stats(&self) -> ContextStats {
        let store = lock(&self.store);
        let finished = store.completed + store.failed;
        ContextStats {
            active: store
                .entries
                .values()
                .filter(|e| e.status == RequestStatus::Active)
                .count(),
            completed: store.completed,
            failed: store.failed,
            tracked_entries: store.entries.len(),
            error_rate: if finished == 0 {
                0.0
            } else {
                store.failed as f64 / finished as f64
            },
            latency: store.history.percentiles(),
            per_service: store
                .per_service
                .iter()
                .map(|(k, w)| (k.clone(), w.percentiles()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Drops finalized entries that ended more than `retention` ago. Active entries stay.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        let mut store = lock(&self.store);
        let before = store.entries.len();
        store
            .entries
            .retain(|_, e| e.end_time.map_or(true, |end| end > cutoff));
        let removed = before - store.entries.len();
        if removed > 0 {
            debug!(removed, remaining = store.entries.len(), "request contexts cleaned up");
        }
        removed
    }

    /// Starts the periodic cleanup loop. Returns false if it was already running.
    pub fn start(self: &Arc<Self>) -> Result<bool> {
        let Some(token) = self.background.begin()? else {
            return Ok(false);
        };
        let this = Arc::downgrade(self);
        let retention = self.config.retention;
        self.background.spawn_periodic(
            &token,
            "context_cleanup",
            self.config.cleanup_interval,
            move || {
                if let Some(this) = this.upgrade() {
                    this.cleanup(retention);
                }
                async {}
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

/// Fails the request if `with_context` is dropped before its work finished, as happens
/// when the caller's future is cancelled or the work panics.
struct FinalizeOnDrop<'a> {
    contexts: &'a RequestContextManager,
    id: Option<String>,
}

impl FinalizeOnDrop<'_> {
    fn disarm(&mut self) -> String {
        self.id.take().unwrap_or_default()
    }
}

impl Drop for FinalizeOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            warn!(request_id = %id, "request dropped before completion");
            let error = Error::runtime_with_context(
                "request cancelled before completion",
                ErrorContext::new().with_source("request_context"),
            );
            self.contexts
                .finalize_quietly(self.contexts.end_request_with_error(&id, &error));
        }
    }
}

impl Default for RequestContextManager {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

fn build_node(
    entries: &HashMap<String, RequestEntry>,
    id: &str,
    visited: &mut HashSet<String>,
) -> Option<TraceNode> {
    let entry = entries.get(id)?;
    if !visited.insert(id.to_string()) {
        return None;
    }
    let children = entry
        .children
        .iter()
        .filter_map(|child| build_node(entries, child, visited))
        .collect();
    Some(TraceNode {
        entry: entry.clone(),
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_child_inherits_trace() {
        let m = RequestContextManager::default();
        let root = m.start_request(StartOptions::new("api", "get").with_metadata("user", "42"));
        let child = m.start_request(StartOptions::new("db", "query").with_parent(&root.id));
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(m.get_request(&root.id).unwrap().children, vec![child.id]);
        assert_eq!(root.metadata.get("user").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_unknown_parent_starts_new_trace() {
        let m = RequestContextManager::default();
        let ctx = m.start_request(StartOptions::new("api", "get").with_parent("missing"));
        assert!(ctx.parent_id.is_none());
        assert_eq!(m.trace_entries(&ctx.trace_id).len(), 1);
    }

    #[test]
    fn test_end_exactly_once() {
        let m = RequestContextManager::default();
        let ctx = m.start_request(StartOptions::new("api", "get"));
        let entry = m.end_request(&ctx.id).unwrap();
        assert_eq!(entry.status, RequestStatus::Completed);
        let end = entry.end_time.unwrap();
        assert!(end >= entry.context.start_time);
        assert_eq!(entry.duration_ms, Some(end - entry.context.start_time));

        assert!(matches!(m.end_request(&ctx.id), Err(Error::Runtime { .. })));
        assert!(matches!(
            m.end_request_with_error(&ctx.id, &Error::transient("late")),
            Err(Error::Runtime { .. })
        ));
        assert!(matches!(m.end_request("nope"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_failed_request_recorded() {
        let m = RequestContextManager::default();
        let ctx = m.start_request(StartOptions::new("api", "get"));
        let entry = m
            .end_request_with_error(&ctx.id, &Error::permanent("bad input"))
            .unwrap();
        assert_eq!(entry.status, RequestStatus::Failed);
        assert!(entry.error.unwrap().contains("bad input"));
        let stats = m.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.error_rate, 1.0);
        assert_eq!(stats.latency.count, 1);
        assert!(stats.per_service.contains_key("api"));
    }

    #[test]
    fn test_trace_with_diamond_visits_once() {
        let m = RequestContextManager::default();
        let root = m.start_request(StartOptions::new("api", "root"));
        let left = m.start_request(StartOptions::new("a", "left").with_parent(&root.id));
        let right = m.start_request(StartOptions::new("b", "right").with_parent(&root.id));
        let shared = m.start_request(StartOptions::new("c", "shared").with_parent(&left.id));
        m.link(&right.id, &shared.id).unwrap();
        // Linking twice is a no-op.
        m.link(&right.id, &shared.id).unwrap();

        let trace = m.get_trace(&root.id).unwrap();
        let ids = trace.ids();
        assert_eq!(trace.node_count(), 4);
        assert_eq!(ids.iter().filter(|id| **id == shared.id).count(), 1);
    }

    #[test]
    fn test_link_rejects_cycles_and_foreign_traces() {
        let m = RequestContextManager::default();
        let a = m.start_request(StartOptions::new("a", "x"));
        let b = m.start_request(StartOptions::new("b", "y"));
        assert!(m.link(&a.id, &a.id).is_err());
        assert!(m.link(&a.id, &b.id).is_err());
        assert!(matches!(m.link(&a.id, "ghost"), Err(Error::NotFound { .. })));

        // A back edge inside one trace is tolerated by the traversal.
        let child = m.start_request(StartOptions::new("c", "z").with_parent(&a.id));
        m.link(&child.id, &a.id).unwrap();
        assert_eq!(m.get_trace(&a.id).unwrap().node_count(), 2);
    }

    #[tokio::test]
    async fn test_with_context_finalizes() {
        let m = RequestContextManager::default();
        let ok: Result<u32> = m
            .with_context(StartOptions::new("api", "ok"), |_| async { Ok(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);
        let err: Result<u32> = m
            .with_context(StartOptions::new("api", "bad"), |_| async {
                Err(Error::transient("boom"))
            })
            .await;
        assert!(err.is_err());
        let stats = m.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_events_emitted() {
        let m = RequestContextManager::default();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let _sub = m
            .subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let ctx = m.start_request(StartOptions::new("api", "get"));
        m.end_request(&ctx.id).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cleanup_keeps_active() {
        let m = RequestContextManager::default();
        let done = m.start_request(StartOptions::new("api", "done"));
        let active = m.start_request(StartOptions::new("api", "active"));
        m.end_request(&done.id).unwrap();
        assert_eq!(m.cleanup(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(m.cleanup(Duration::ZERO), 1);
        assert!(m.get_request(&done.id).is_none());
        assert!(m.get_request(&active.id).is_some());
        // History survives cleanup.
        assert_eq!(m.percentiles().count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_loop() {
        let m = Arc::new(RequestContextManager::new(ContextConfig {
            retention: Duration::ZERO,
            cleanup_interval: Duration::from_millis(10),
            ..ContextConfig::default()
        }));
        let ctx = m.start_request(StartOptions::new("api", "get"));
        m.end_request(&ctx.id).unwrap();
        assert!(m.start().unwrap());
        assert!(!m.start().unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(m.get_request(&ctx.id).is_none());
        assert!(m.stop().await);
    }
}
