//! Serde adapter storing a `Duration` as integer milliseconds.
//!
//! ```rust
//! use serde::Deserialize;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Cfg {
//!     #[serde(with = "backend_orchestrator::utils::duration_ms")]
//!     timeout: Duration,
//! }
//!
//! let cfg: Cfg = serde_json::from_str(r#"{"timeout": 1500}"#).unwrap();
//! assert_eq!(cfg.timeout, Duration::from_millis(1500));
//! ```

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

