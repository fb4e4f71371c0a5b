//! Typed events and listener fan-out.
//!
//! The circuit breaker coordinator, the request context manager and the health aggregator
//! each own an [`EventBus`]. Listeners are plain closures; a panicking listener is caught and
//! logged so the remaining listeners still receive the event.
//!
//! ```rust
//! use backend_orchestrator::events::{BackendEvent, EventBus, EventKind};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new("example");
//! let seen = Arc::new(AtomicUsize::new(0));
//! let seen_clone = Arc::clone(&seen);
//! let sub = bus
//!     .subscribe(move |e: &BackendEvent| {
//!         if e.kind() == EventKind::CallSuccess {
//!             seen_clone.fetch_add(1, Ordering::SeqCst);
//!         }
//!     })
//!     .unwrap();
//!
//! bus.emit(BackendEvent::CallSuccess { service: "db".into(), duration_ms: 3 });
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! sub.unsubscribe();
//! assert_eq!(bus.listener_count(), 0);
//! ```

use crate::health::{Alert, HealthStatus};
use crate::resilience::circuit_breaker::CircuitState;
use crate::utils::{read, write};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{trace, warn};

pub const DEFAULT_MAX_LISTENERS: usize = 64;

/// Why a call was refused without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    CircuitOpen,
    HalfOpenSaturated,
    RateLimited,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    StateChange {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },
    CallSuccess {
        service: String,
        duration_ms: u64,
    },
    CallFailure {
        service: String,
        error: String,
        duration_ms: u64,
    },
    CallRejected {
        service: String,
        reason: RejectionReason,
        fallback_used: bool,
    },
    CallTimeout {
        service: String,
        timeout_ms: u64,
    },
    RequestStarted {
        request_id: String,
        trace_id: String,
        service: String,
        operation: String,
    },
    RequestCompleted {
        request_id: String,
        trace_id: String,
        service: String,
        operation: String,
        duration_ms: u64,
    },
    RequestFailed {
        request_id: String,
        trace_id: String,
        service: String,
        operation: String,
        duration_ms: u64,
        error: String,
    },
    HealthChanged {
        service: String,
        from: HealthStatus,
        to: HealthStatus,
        score: f64,
    },
    AlertRaised(Alert),
}

/// Discriminant of [`BackendEvent`], handy for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChange,
    CallSuccess,
    CallFailure,
    CallRejected,
    CallTimeout,
    RequestStarted,
    RequestCompleted,
    RequestFailed,
    HealthChanged,
    AlertRaised,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChange => "state_change",
            Self::CallSuccess => "call_success",
            Self::CallFailure => "call_failure",
            Self::CallRejected => "call_rejected",
            Self::CallTimeout => "call_timeout",
            Self::RequestStarted => "request_started",
            Self::RequestCompleted => "request_completed",
            Self::RequestFailed => "request_failed",
            Self::HealthChanged => "health_changed",
            Self::AlertRaised => "alert_raised",
        }
    }
}

impl BackendEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StateChange { .. } => EventKind::StateChange,
            Self::CallSuccess { .. } => EventKind::CallSuccess,
            Self::CallFailure { .. } => EventKind::CallFailure,
            Self::CallRejected { .. } => EventKind::CallRejected,
            Self::CallTimeout { .. } => EventKind::CallTimeout,
            Self::RequestStarted { .. } => EventKind::RequestStarted,
            Self::RequestCompleted { .. } => EventKind::RequestCompleted,
            Self::RequestFailed { .. } => EventKind::RequestFailed,
            Self::HealthChanged { .. } => EventKind::HealthChanged,
            Self::AlertRaised(_) => EventKind::AlertRaised,
        }
    }

    /// Service the event concerns.
    pub fn service(&self) -> &str {
        match self {
            Self::StateChange { service, .. }
            | Self::CallSuccess { service, .. }
            | Self::CallFailure { service, .. }
            | Self::CallRejected { service, .. }
            | Self::CallTimeout { service, .. }
            | Self::RequestStarted { service, .. }
            | Self::RequestCompleted { service, .. }
            | Self::RequestFailed { service, .. }
            | Self::HealthChanged { service, .. } => service,
            Self::AlertRaised(alert) => &alert.service,
        }
    }
}

pub type Listener = Arc<dyn Fn(&BackendEvent) + Send + Sync>;

struct BusInner {
    source: &'static str,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
    max_listeners: usize,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

/// Bounded set of listeners for one component.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(source: &'static str) -> Self {
        Self::with_max_listeners(source, DEFAULT_MAX_LISTENERS)
    }

    pub fn with_max_listeners(source: &'static str, max_listeners: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                source,
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                max_listeners,
            }),
        }
    }

    /// Adds a listener. Fails once the bus holds `max_listeners` listeners.
    pub fn subscribe<F>(&self, listener: F) -> Result<Subscription>
    where
        F: Fn(&BackendEvent) + Send + Sync + 'static,
    {
        let mut listeners = write(&self.inner.listeners);
        if listeners.len() >= self.inner.max_listeners {
            return Err(Error::validation_with_context(
                format!("listener limit of {} reached", self.inner.max_listeners),
                ErrorContext::new().with_source(self.inner.source),
            ));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        listeners.push((id, Arc::new(listener)));
        Ok(Subscription {
            handles: vec![(Arc::downgrade(&self.inner), id)],
        })
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        read(&self.inner.listeners).len()
    }

    /// Delivers `event` to every listener registered at the time of the call.
    pub fn emit(&self, event: BackendEvent) {
        let listeners: Vec<(u64, Listener)> = read(&self.inner.listeners).clone();
        if listeners.is_empty() {
            return;
        }
        trace!(
            source = self.inner.source,
            kind = event.kind().as_str(),
            service = event.service(),
            listeners = listeners.len(),
            "emitting event"
        );
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(
                    source = self.inner.source,
                    listener_id = id,
                    kind = event.kind().as_str(),
                    "event listener panicked; continuing with remaining listeners"
                );
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("source", &self.inner.source)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Disposer returned by [`EventBus::subscribe`]. Dropping it keeps the listener registered;
/// call [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    handles: Vec<(Weak<BusInner>, u64)>,
}

impl Subscription {
    /// Combines several subscriptions into one disposer.
    pub fn merge(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        Self {
            handles: subscriptions
                .into_iter()
                .flat_map(|s| s.handles)
                .collect(),
        }
    }

    /// Listener ids covered by this subscription.
    pub fn ids(&self) -> Vec<u64> {
        self.handles.iter().map(|(_, id)| *id).collect()
    }

    /// Removes every listener covered by this subscription. Returns how many were removed.
    pub fn unsubscribe(self) -> usize {
        self.handles
            .iter()
            .filter(|(bus, id)| bus.upgrade().map(|b| b.remove(*id)).unwrap_or(false))
            .count()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("ids", &self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn success(service: &str) -> BackendEvent {
        BackendEvent::CallSuccess {
            service: service.to_string(),
            duration_ms: 1,
        }
    }

    #[test]
    fn test_emit_reaches_all_listeners() {
        let bus = EventBus::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let mut subs = Vec::new();
        for _ in 0..3 {
            let c = Arc::clone(&count);
            subs.push(
                bus.subscribe(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        bus.emit(success("a"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let _bad = bus.subscribe(|_| panic!("bad subscriber")).unwrap();
        let c = Arc::clone(&count);
        let _good = bus
            .subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        bus.emit(success("a"));
        bus.emit(success("b"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = bus
            .subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        bus.emit(success("a"));
        assert_eq!(sub.unsubscribe(), 1);
        bus.emit(success("a"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_listener_limit() {
        let bus = EventBus::with_max_listeners("test", 2);
        let _a = bus.subscribe(|_| {}).unwrap();
        let _b = bus.subscribe(|_| {}).unwrap();
        assert!(bus.subscribe(|_| {}).is_err());
    }

    #[test]
    fn test_merged_subscription_spans_buses() {
        let a = EventBus::new("a");
        let b = EventBus::new("b");
        let sub = Subscription::merge(vec![
            a.subscribe(|_| {}).unwrap(),
            b.subscribe(|_| {}).unwrap(),
        ]);
        assert_eq!(sub.ids().len(), 2);
        assert_eq!(sub.unsubscribe(), 2);
        assert_eq!(a.listener_count() + b.listener_count(), 0);
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(success("x").kind().as_str(), "call_success");
        assert_eq!(success("x").service(), "x");
        let json = serde_json::to_value(success("x")).unwrap();
        assert_eq!(json["type"], "call_success");
    }
}
