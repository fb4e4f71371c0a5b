use crate::error_code::{ErrorCode, FailureClass};
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "services[0].circuit.failure_threshold")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "circuit_breaker", "request_queue")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the orchestration core.
///
/// Policy rejections (`CircuitOpen`, `RateLimited`, `QueueOverflow`) are raised before the
/// wrapped function runs. `Transient` and `Permanent` carry failures reported by the
/// caller-supplied operation. The type is `Clone` so a terminal error can be stored on a
/// queue item or request entry and handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Circuit breaker open for service '{service}'")]
    CircuitOpen {
        service: String,
        /// Time until the circuit will admit a probe call, if known.
        retry_after_ms: Option<u64>,
    },

    #[error("Rate limit exceeded for service '{service}'{}", format_retry_after(.retry_after_ms))]
    RateLimited {
        service: String,
        /// `None` when the bucket never refills.
        retry_after_ms: Option<u64>,
    },

    #[error("Queue overflow for service '{service}' (max size {max_size})")]
    QueueOverflow { service: String, max_size: usize },

    #[error("Operation '{operation}' on service '{service}' timed out after {timeout_ms}ms")]
    Timeout {
        service: String,
        operation: String,
        timeout_ms: u64,
    },

    #[error("Gave up waiting for queue item '{item_id}' after {timeout_ms}ms")]
    WaitTimeout { item_id: String, timeout_ms: u64 },

    #[error("Transient failure: {message}{}", format_context(.context))]
    Transient {
        message: String,
        context: ErrorContext,
    },

    #[error("Permanent failure: {message}{}", format_context(.context))]
    Permanent {
        message: String,
        context: ErrorContext,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_retry_after(retry_after_ms: &Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!(", retry after {}ms", ms),
        None => String::new(),
    }
}

impl Error {
    /// A retryable failure reported by a downstream operation.
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    /// A non-retryable failure reported by a downstream operation.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Error::Permanent {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new transient error with structured context
    pub fn transient_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Transient {
            message: msg.into(),
            context,
        }
    }

    /// Create a new permanent error with structured context
    pub fn permanent_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Permanent {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transient { context, .. }
            | Error::Permanent { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Canonical code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Error::RateLimited { .. } => ErrorCode::RateLimited,
            Error::QueueOverflow { .. } => ErrorCode::QueueOverflow,
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::WaitTimeout { .. } => ErrorCode::WaitTimeout,
            Error::Transient { .. } => ErrorCode::TransientFailure,
            Error::Permanent { .. } => ErrorCode::PermanentFailure,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::Configuration { .. } | Error::Validation { .. } => ErrorCode::InvalidRequest,
            Error::Runtime { .. } => ErrorCode::Lifecycle,
        }
    }

    pub fn class(&self) -> FailureClass {
        self.code().class()
    }

    pub fn is_retryable(&self) -> bool {
        self.code().retryable()
    }

    /// True for errors raised before the wrapped function ran.
    pub fn is_policy_rejection(&self) -> bool {
        self.class() == FailureClass::PolicyRejection
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::validation_with_context(
            e.to_string(),
            ErrorContext::new().with_source("serde_json"),
        )
    }
}
