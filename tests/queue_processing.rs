use backend_orchestrator::queue::{
    processor_fn, EnqueueOptions, Priority, QueueConfig, QueueItem, QueueManager, QueueStatus,
};
use backend_orchestrator::Error;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_max_size_two_overflows_on_third() {
    let queue = QueueManager::default();
    assert_ok!(queue.configure("emails", QueueConfig::new().with_max_size(2)));
    let first = assert_ok!(queue.enqueue("emails", "send", json!({"to": "a"}), EnqueueOptions::new()));
    let second = assert_ok!(queue.enqueue("emails", "send", json!({"to": "b"}), EnqueueOptions::new()));
    assert_ne!(first, second);
    let err = assert_err!(queue.enqueue("emails", "send", json!({"to": "c"}), EnqueueOptions::new()));
    assert!(matches!(err, Error::QueueOverflow { .. }));
    assert!(err.is_policy_rejection());

    // Other services have their own bound.
    assert_ok!(queue.enqueue("sms", "send", json!({}), EnqueueOptions::new()));
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let queue = QueueManager::default();
    queue
        .configure("render", QueueConfig::new().with_max_concurrent(2))
        .unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
    queue.register_processor(
        "render",
        processor_fn(move |_item: QueueItem| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }),
    );
    for i in 0..8 {
        queue
            .enqueue("render", "page", json!(i), EnqueueOptions::new())
            .unwrap();
    }
    assert!(queue.drain(Duration::from_secs(5)).await);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let status = queue.queue_status("render").unwrap();
    assert_eq!(status.completed, 8);
    assert_eq!(status.processing, 0);
}

#[derive(Debug, Deserialize, PartialEq)]
struct Receipt {
    id: u32,
    accepted: bool,
}

#[tokio::test]
async fn test_enqueue_and_wait_with_background_dispatch() {
    let queue = QueueManager::new(
        QueueConfig::new().with_dispatch_interval(Duration::from_millis(5)),
    );
    queue.register_processor(
        "orders",
        processor_fn(|item: QueueItem| async move {
            let id = item.payload["id"].as_u64().unwrap_or_default();
            Ok(json!({ "id": id, "accepted": true }))
        }),
    );
    assert!(queue.start().unwrap());
    assert!(!queue.start().unwrap());

    let receipt: Receipt = queue
        .enqueue_and_wait(
            "orders",
            "place",
            json!({ "id": 41 }),
            EnqueueOptions::new().with_priority(Priority::High),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(receipt, Receipt { id: 41, accepted: true });

    assert!(queue.stop().await);
    assert!(!queue.is_running());
    assert!(!queue.stop().await);
}

#[tokio::test]
async fn test_failed_item_keeps_error_for_waiters() {
    let queue = QueueManager::default();
    queue.register_processor(
        "billing",
        processor_fn(|_item: QueueItem| async { Err(Error::permanent("card declined")) }),
    );
    let id = queue
        .enqueue("billing", "charge", json!({}), EnqueueOptions::new())
        .unwrap();
    assert!(queue.drain(Duration::from_secs(2)).await);

    let item = queue.get_item(&id).unwrap();
    assert_eq!(item.status, QueueStatus::Failed);
    assert!(item.error.as_deref().unwrap_or_default().contains("card declined"));

    let err = queue
        .wait_for_completion(&id, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Permanent { .. }));
}

#[tokio::test]
async fn test_panicking_processor_releases_its_slot() {
    let queue = QueueManager::default();
    queue
        .configure("thumbs", QueueConfig::new().with_max_concurrent(1))
        .unwrap();
    queue.register_processor(
        "thumbs",
        processor_fn(|item: QueueItem| async move {
            if item.payload == json!("corrupt") {
                panic!("decoder crashed");
            }
            Ok(item.payload)
        }),
    );
    let bad = queue
        .enqueue("thumbs", "resize", json!("corrupt"), EnqueueOptions::new())
        .unwrap();
    let good = queue
        .enqueue("thumbs", "resize", json!("ok.png"), EnqueueOptions::new())
        .unwrap();
    assert!(queue.drain(Duration::from_secs(2)).await);

    let status = queue.queue_status("thumbs").unwrap();
    assert_eq!((status.processing, status.completed, status.failed), (0, 1, 1));
    assert_eq!(queue.get_item(&bad).unwrap().status, QueueStatus::Failed);
    assert_eq!(queue.get_item(&good).unwrap().status, QueueStatus::Completed);

    let err = queue
        .wait_for_completion(&bad, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Permanent { .. }));
    assert!(err.to_string().contains("decoder crashed"));
}

#[tokio::test]
async fn test_cleanup_removes_finished_items_after_retention() {
    let queue = QueueManager::new(QueueConfig::new().with_retention(Duration::ZERO));
    queue.register_processor(
        "jobs",
        processor_fn(|item: QueueItem| async move { Ok(item.payload) }),
    );
    let done = queue
        .enqueue("jobs", "run", json!(1), EnqueueOptions::new())
        .unwrap();
    assert!(queue.drain(Duration::from_secs(2)).await);
    let waiting = queue
        .enqueue("idle", "run", json!(2), EnqueueOptions::new())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(queue.cleanup() >= 1);
    assert!(queue.get_item(&done).is_none());
    // Pending work is never cleaned up.
    assert_eq!(queue.get_item(&waiting).unwrap().status, QueueStatus::Pending);

    let stats = queue.stats();
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.total_pending, 1);
}

#[tokio::test]
async fn test_unknown_item_is_not_found() {
    let queue = QueueManager::default();
    let err = queue
        .wait_for_completion("missing", Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}
