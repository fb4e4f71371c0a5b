//! Priority request queue with bounded size, deduplication, retries and
//! concurrency-limited dispatch.
//!
//! Items are served critical > high > normal > low, FIFO within a class. A background
//! dispatcher (see [`QueueManager::start`]) hands items to the service's registered
//! [`QueueProcessor`] under a timeout. Waiters are woken through a per-item watch channel.
//!
//! ```rust
//! use backend_orchestrator::queue::{processor_fn, EnqueueOptions, Priority, QueueItem, QueueManager};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let queue = QueueManager::default();
//! queue.register_processor(
//!     "mailer",
//!     processor_fn(|item: QueueItem| async move { Ok(json!({ "sent": item.payload["to"] })) }),
//! );
//! queue.start().unwrap();
//!
//! let sent: serde_json::Value = queue
//!     .enqueue_and_wait(
//!         "mailer",
//!         "send",
//!         json!({ "to": "ops@example.com" }),
//!         EnqueueOptions::new().with_priority(Priority::High),
//!         Duration::from_secs(5),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(sent["sent"], "ops@example.com");
//! queue.stop().await;
//! # });
//! ```

mod item;
mod manager;

pub use item::{
    EnqueueOptions, Priority, QueueConfig, QueueItem, QueueSnapshot, QueueStats, QueueStatus,
};
pub use manager::{processor_fn, FnProcessor, QueueManager, QueueProcessor};
pub(crate) use manager::QueueJob;
