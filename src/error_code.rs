//! Canonical error codes and failure classes.
//!
//! Every [`crate::Error`] maps to one [`ErrorCode`], and every code belongs to one
//! [`FailureClass`]. The class drives retry decisions in the queue and fallback
//! dispatch in the circuit breaker.
//!
//! ## Error Code Categories
//!
//! | Prefix | Category    | Description                                 |
//! |--------|-------------|---------------------------------------------|
//! | E1xxx  | permanent   | Non-retryable failures (validation, lookup) |
//! | E2xxx  | policy      | Rejected before the wrapped call ran        |
//! | E3xxx  | transient   | Retryable downstream failures               |
//! | E4xxx  | operational | Lifecycle and waiter errors                 |
//! | E9xxx  | unknown     | Catch-all / unclassified                    |
//!
//! ## Example
//!
//! ```rust
//! use backend_orchestrator::error_code::{ErrorCode, FailureClass};
//!
//! let code = ErrorCode::from_name("rate_limited");
//! assert_eq!(code.code(), "E2002");
//! assert_eq!(code.class(), FailureClass::PolicyRejection);
//! assert!(code.fallbackable());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse failure taxonomy used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retryable: network, timeout, server error.
    Transient,
    /// Non-retryable: validation, not-found.
    Permanent,
    /// The wrapped function never ran (circuit open, rate limited, queue full).
    PolicyRejection,
    /// Lifecycle or waiter failures that say nothing about the downstream service.
    Operational,
}

impl FailureClass {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Canonical error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// E1001: invalid arguments or configuration
    InvalidRequest,
    /// E1002: unknown service, item or request
    NotFound,
    /// E1003: downstream reported a non-retryable failure
    PermanentFailure,
    /// E2001: circuit breaker rejected the call
    CircuitOpen,
    /// E2002: token bucket denied the call
    RateLimited,
    /// E2003: queue is full
    QueueOverflow,
    /// E3001: downstream reported a retryable failure
    TransientFailure,
    /// E3002: call exceeded its deadline
    Timeout,
    /// E4001: caller gave up waiting for a queued item
    WaitTimeout,
    /// E4002: component not running, shut down, or internal fault
    Lifecycle,
    /// E9999: could not be classified
    Unknown,
}

impl ErrorCode {
    /// Returns the canonical code string (e.g., `"E2001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "E1001",
            Self::NotFound => "E1002",
            Self::PermanentFailure => "E1003",
            Self::CircuitOpen => "E2001",
            Self::RateLimited => "E2002",
            Self::QueueOverflow => "E2003",
            Self::TransientFailure => "E3001",
            Self::Timeout => "E3002",
            Self::WaitTimeout => "E4001",
            Self::Lifecycle => "E4002",
            Self::Unknown => "E9999",
        }
    }

    /// Returns the standard name (e.g., `"circuit_open"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::PermanentFailure => "permanent_failure",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
            Self::QueueOverflow => "queue_overflow",
            Self::TransientFailure => "transient_failure",
            Self::Timeout => "timeout",
            Self::WaitTimeout => "wait_timeout",
            Self::Lifecycle => "lifecycle",
            Self::Unknown => "unknown",
        }
    }

    #[inline]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::InvalidRequest | Self::NotFound | Self::PermanentFailure => {
                FailureClass::Permanent
            }
            Self::CircuitOpen | Self::RateLimited | Self::QueueOverflow => {
                FailureClass::PolicyRejection
            }
            Self::TransientFailure | Self::Timeout | Self::Unknown => FailureClass::Transient,
            Self::WaitTimeout | Self::Lifecycle => FailureClass::Operational,
        }
    }

    /// Whether the queue may redispatch an item that failed with this code.
    #[inline]
    pub fn retryable(&self) -> bool {
        self.class().retryable()
    }

    /// Whether a registered fallback should run instead of surfacing the error.
    #[inline]
    pub fn fallbackable(&self) -> bool {
        matches!(self.class(), FailureClass::PolicyRejection)
    }

    /// Maps a code name to the corresponding `ErrorCode`; unknown names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "invalid_request" | "validation" | "configuration" => Self::InvalidRequest,
            "not_found" => Self::NotFound,
            "permanent_failure" | "permanent" => Self::PermanentFailure,
            "circuit_open" => Self::CircuitOpen,
            "rate_limited" => Self::RateLimited,
            "queue_overflow" => Self::QueueOverflow,
            "transient_failure" | "transient" => Self::TransientFailure,
            "timeout" => Self::Timeout,
            "wait_timeout" => Self::WaitTimeout,
            "lifecycle" | "runtime" => Self::Lifecycle,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_codes_are_fallbackable_not_retryable() {
        for code in [
            ErrorCode::CircuitOpen,
            ErrorCode::RateLimited,
            ErrorCode::QueueOverflow,
        ] {
            assert!(code.fallbackable(), "{} should be fallbackable", code.name());
            assert!(!code.retryable(), "{} should not be retryable", code.name());
        }
    }

    #[test]
    fn test_transient_codes_are_retryable() {
        assert!(ErrorCode::Timeout.retryable());
        assert!(ErrorCode::TransientFailure.retryable());
        assert!(!ErrorCode::PermanentFailure.retryable());
        assert!(!ErrorCode::NotFound.retryable());
    }

    #[test]
    fn test_from_name_roundtrips_canonical_names() {
        for code in [
            ErrorCode::InvalidRequest,
            ErrorCode::NotFound,
            ErrorCode::PermanentFailure,
            ErrorCode::CircuitOpen,
            ErrorCode::RateLimited,
            ErrorCode::QueueOverflow,
            ErrorCode::TransientFailure,
            ErrorCode::Timeout,
            ErrorCode::WaitTimeout,
            ErrorCode::Lifecycle,
        ] {
            assert_eq!(ErrorCode::from_name(code.name()), code);
        }
        assert_eq!(ErrorCode::from_name("nope"), ErrorCode::Unknown);
    }

    #[test]
    fn test_display_uses_code_string() {
        assert_eq!(ErrorCode::Timeout.to_string(), "E3002");
    }
}
