use super::item::{
    EnqueueOptions, Priority, QueueConfig, QueueItem, QueueSnapshot, QueueStats, QueueStatus,
};
use crate::error_code::FailureClass;
use crate::utils::background::Background;
use crate::utils::{lock, millis_f64, now_ms, read, write, SlidingWindow, ThroughputWindow};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Work handler for one service's queue.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    async fn process(&self, item: QueueItem) -> Result<Value>;
}

pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> QueueProcessor for FnProcessor<F>
where
    F: Fn(QueueItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn process(&self, item: QueueItem) -> Result<Value> {
        (self.f)(item).await
    }
}

pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn QueueProcessor>
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

/// One-shot work carried by a single item in place of the service's processor.
pub(crate) type QueueJob = Box<dyn FnOnce(QueueItem) -> BoxFuture<'static, Result<Value>> + Send>;

enum Runner {
    Processor(Arc<dyn QueueProcessor>),
    Job(QueueJob),
}

impl Runner {
    async fn run(self, item: QueueItem) -> Result<Value> {
        match self {
            Runner::Processor(p) => p.process(item).await,
            Runner::Job(job) => job(item).await,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

struct Tracked {
    item: QueueItem,
    job: Option<QueueJob>,
    notify: watch::Sender<QueueStatus>,
    queued_at: Instant,
    started_at: Option<Instant>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    enqueued: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    retried: u64,
    rejected: u64,
    deduplicated: u64,
}

struct ServiceQueue {
    config: QueueConfig,
    pending: [VecDeque<String>; 4],
    processing: usize,
    items: HashMap<String, Tracked>,
    dedup: LruCache<String, (String, Instant)>,
    wait_times: SlidingWindow<f64>,
    processing_times: SlidingWindow<f64>,
    throughput: ThroughputWindow,
    counters: Counters,
}

fn dedup_capacity(config: &QueueConfig) -> NonZeroUsize {
    NonZeroUsize::new(config.deduplication_capacity).unwrap_or(NonZeroUsize::MIN)
}

impl ServiceQueue {
    fn new(config: QueueConfig) -> Self {
        Self {
            dedup: LruCache::new(dedup_capacity(&config)),
            wait_times: SlidingWindow::new(config.stats_window),
            processing_times: SlidingWindow::new(config.stats_window),
            throughput: ThroughputWindow::new(config.stats_window, Duration::from_secs(60)),
            pending: Default::default(),
            processing: 0,
            items: HashMap::new(),
            counters: Counters::default(),
            config,
        }
    }

    fn reconfigure(&mut self, config: QueueConfig) {
        self.dedup.resize(dedup_capacity(&config));
        self.config = config;
    }

    fn pending_len(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    /// Existing item id for `key` while its entry is fresh; stale entries are dropped.
    fn dedup_lookup(&mut self, key: &str) -> Option<String> {
        let ttl = self.config.deduplication_ttl;
        let hit = self
            .dedup
            .get(key)
            .map(|(id, at)| (id.clone(), at.elapsed() < ttl));
        match hit {
            Some((id, true)) if self.items.contains_key(&id) => Some(id),
            Some(_) => {
                self.dedup.pop(key);
                None
            }
            None => None,
        }
    }

    /// Next runnable item. Without a processor only items carrying their own job qualify.
    fn pop_next(&mut self, has_processor: bool) -> Option<String> {
        let items = &self.items;
        let pending = |id: &String| {
            items
                .get(id)
                .filter(|t| t.item.status == QueueStatus::Pending)
        };
        for deque in self.pending.iter_mut() {
            if has_processor {
                while let Some(id) = deque.pop_front() {
                    if pending(&id).is_some() {
                        return Some(id);
                    }
                }
            } else if let Some(pos) = deque
                .iter()
                .position(|id| pending(id).is_some_and(|t| t.job.is_some()))
            {
                return deque.remove(pos);
            }
        }
        None
    }

    fn snapshot(&mut self, service: &str, has_processor: bool) -> QueueSnapshot {
        let pending_by_priority = Priority::ALL
            .iter()
            .map(|p| (*p, self.pending[p.index()].len()))
            .collect::<BTreeMap<_, _>>();
        QueueSnapshot {
            service: service.to_string(),
            pending: self.pending_len(),
            pending_by_priority,
            processing: self.processing,
            tracked_items: self.items.len(),
            max_size: self.config.max_size,
            max_concurrent: self.config.max_concurrent,
            has_processor,
            enqueued: self.counters.enqueued,
            completed: self.counters.completed,
            failed: self.counters.failed,
            timed_out: self.counters.timed_out,
            retried: self.counters.retried,
            rejected: self.counters.rejected,
            deduplicated: self.counters.deduplicated,
            wait_time: self.wait_times.percentiles(),
            processing_time: self.processing_times.percentiles(),
            throughput_per_sec: self.throughput.rate_per_sec(),
        }
    }
}

type SharedQueue = Arc<Mutex<ServiceQueue>>;

struct Shared {
    default_config: QueueConfig,
    queues: RwLock<HashMap<String, SharedQueue>>,
    processors: RwLock<HashMap<String, Arc<dyn QueueProcessor>>>,
    workers: TaskTracker,
    background: Background,
}

impl Shared {
    fn queue(&self, service: &str) -> SharedQueue {
        if let Some(q) = read(&self.queues).get(service) {
            return Arc::clone(q);
        }
        let mut queues = write(&self.queues);
        Arc::clone(queues.entry(service.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ServiceQueue::new(self.default_config.clone())))
        }))
    }

    fn existing(&self, service: &str) -> Option<SharedQueue> {
        read(&self.queues).get(service).cloned()
    }

    fn all(&self) -> Vec<(String, SharedQueue)> {
        let mut out: Vec<_> = read(&self.queues)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn dispatch_all(self: &Arc<Self>) -> usize {
        self.all()
            .iter()
            .map(|(service, _)| self.dispatch_service(service))
            .sum()
    }

    /// Starts pending items for `service` until its concurrency limit is reached.
    fn dispatch_service(self: &Arc<Self>, service: &str) -> usize {
        let processor = read(&self.processors).get(service).cloned();
        let Some(queue) = self.existing(service) else {
            return 0;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(service, "queue dispatch requires a tokio runtime");
            return 0;
        }

        let mut started = 0;
        loop {
            let (job, runner) = {
                let mut guard = lock(&queue);
                let q = &mut *guard;
                if q.processing >= q.config.max_concurrent {
                    break;
                }
                let Some(id) = q.pop_next(processor.is_some()) else {
                    break;
                };
                let Some(t) = q.items.get_mut(&id) else {
                    continue;
                };
                let runner = match (t.job.take(), &processor) {
                    (Some(job), _) => Runner::Job(job),
                    (None, Some(p)) => Runner::Processor(Arc::clone(p)),
                    (None, None) => continue,
                };
                t.item.status = QueueStatus::Processing;
                t.item.started_at = Some(now_ms());
                t.started_at = Some(Instant::now());
                t.notify.send_replace(QueueStatus::Processing);
                q.wait_times.push(millis_f64(t.queued_at.elapsed()));
                q.processing += 1;
                (t.item.clone(), runner)
            };
            trace!(
                service,
                item_id = %job.id,
                priority = job.priority.as_str(),
                attempt = job.retry_count + 1,
                "dispatching queue item"
            );
            started += 1;
            let shared = Arc::clone(self);
            self.workers.spawn(async move { shared.run_item(runner, job).await });
        }
        started
    }

    async fn run_item(self: Arc<Self>, runner: Runner, item: QueueItem) {
        let timeout = item.timeout;
        let service = item.service.clone();
        let id = item.id.clone();
        let operation = item.operation.clone();
        let work = tokio::time::timeout(timeout, runner.run(item));
        // A panicking processor must still release its slot and wake waiters.
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Timeout {
                service: service.clone(),
                operation,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(service = %service, item_id = %id, panic = message, "queue processor panicked");
                Err(Error::permanent_with_context(
                    format!("queue processor panicked: {}", message),
                    ErrorContext::new()
                        .with_details(format!("operation: {}", operation))
                        .with_source("request_queue"),
                ))
            }
        };
        self.finish_item(&service, &id, outcome);
        if self.background.is_running() {
            self.dispatch_service(&service);
        }
    }

    fn finish_item(&self, service: &str, id: &str, outcome: Result<Value>) {
        let Some(queue) = self.existing(service) else {
            return;
        };
        let mut guard = lock(&queue);
        let q = &mut *guard;
        q.processing = q.processing.saturating_sub(1);
        let Some(t) = q.items.get_mut(id) else {
            return;
        };
        let elapsed_ms = t
            .started_at
            .map(|s| millis_f64(s.elapsed()))
            .unwrap_or_default();

        match outcome {
            Ok(value) => {
                t.item.status = QueueStatus::Completed;
                t.item.result = Some(value);
                t.item.completed_at = Some(now_ms());
                q.processing_times.push(elapsed_ms);
                q.throughput.record();
                q.counters.completed += 1;
                debug!(service, item_id = id, elapsed_ms, "queue item completed");
            }
            Err(e) => {
                let retry = e.class() != FailureClass::Permanent
                    && t.item.retry_count < t.item.max_retries;
                t.item.error = Some(e.to_string());
                if retry {
                    t.item.retry_count += 1;
                    t.item.status = QueueStatus::Pending;
                    t.item.started_at = None;
                    t.started_at = None;
                    t.queued_at = Instant::now();
                    q.pending[t.item.priority.index()].push_front(id.to_string());
                    q.counters.retried += 1;
                    warn!(
                        service,
                        item_id = id,
                        retry = t.item.retry_count,
                        max_retries = t.item.max_retries,
                        error = %e,
                        "queue item failed; retrying"
                    );
                } else {
                    t.item.status = if e.is_timeout() {
                        QueueStatus::Timeout
                    } else {
                        QueueStatus::Failed
                    };
                    t.item.completed_at = Some(now_ms());
                    q.processing_times.push(elapsed_ms);
                    if e.is_timeout() {
                        q.counters.timed_out += 1;
                    } else {
                        q.counters.failed += 1;
                    }
                    warn!(
                        service,
                        item_id = id,
                        retries = t.item.retry_count,
                        error = %e,
                        "queue item failed"
                    );
                }
                t.item.last_error = Some(e);
            }
        }
        t.notify.send_replace(t.item.status);
    }

    fn totals(&self) -> (usize, usize) {
        self.all().iter().fold((0, 0), |(p, r), (_, q)| {
            let q = lock(q);
            (p + q.pending_len(), r + q.processing)
        })
    }
}

/// Per-service priority queues with concurrency-limited dispatch.
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    pub fn new(default_config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                default_config,
                queues: RwLock::new(HashMap::new()),
                processors: RwLock::new(HashMap::new()),
                workers: TaskTracker::new(),
                background: Background::new("request_queue"),
            }),
        }
    }

    pub fn default_config(&self) -> &QueueConfig {
        &self.shared.default_config
    }

    pub fn configure(&self, service: &str, config: QueueConfig) -> Result<()> {
        config.validate()?;
        let mut queues = write(&self.shared.queues);
        match queues.get(service) {
            Some(q) => lock(q).reconfigure(config),
            None => {
                queues.insert(
                    service.to_string(),
                    Arc::new(Mutex::new(ServiceQueue::new(config))),
                );
            }
        }
        debug!(service, "queue configured");
        Ok(())
    }

    pub fn register_processor(&self, service: &str, processor: Arc<dyn QueueProcessor>) {
        write(&self.shared.processors).insert(service.to_string(), processor);
        self.shared.queue(service);
        debug!(service, "queue processor registered");
    }

    pub fn remove_processor(&self, service: &str) -> bool {
        write(&self.shared.processors).remove(service).is_some()
    }

    pub fn has_processor(&self, service: &str) -> bool {
        read(&self.shared.processors).contains_key(service)
    }

    /// Adds an item and returns its id.
    ///
    /// A deduplication key seen within the TTL returns the earlier item's id instead.
    pub fn enqueue(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<String> {
        self.insert(service, operation, payload, options, None)
    }

    /// Adds an item that runs `job` instead of the service's processor. The job runs at
    /// most once, so the item is never retried.
    pub(crate) fn enqueue_job(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: EnqueueOptions,
        job: QueueJob,
    ) -> Result<String> {
        let options = EnqueueOptions {
            max_retries: Some(0),
            ..options
        };
        self.insert(service, operation, payload, options, Some(job))
    }

    fn insert(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: EnqueueOptions,
        job: Option<QueueJob>,
    ) -> Result<String> {
        if service.trim().is_empty() {
            return Err(Error::validation_with_context(
                "service name must not be empty",
                ErrorContext::new().with_source("request_queue"),
            ));
        }
        let queue = self.shared.queue(service);
        let id = {
            let mut guard = lock(&queue);
            let q = &mut *guard;
            if let Some(key) = options.deduplication_key.as_deref() {
                if let Some(existing) = q.dedup_lookup(key) {
                    q.counters.deduplicated += 1;
                    debug!(service, key, item_id = %existing, "duplicate enqueue collapsed");
                    return Ok(existing);
                }
            }
            if q.pending_len() >= q.config.max_size {
                q.counters.rejected += 1;
                warn!(service, max_size = q.config.max_size, "queue overflow");
                return Err(Error::QueueOverflow {
                    service: service.to_string(),
                    max_size: q.config.max_size,
                });
            }

            let id = Uuid::new_v4().to_string();
            let item = QueueItem {
                id: id.clone(),
                service: service.to_string(),
                operation: operation.to_string(),
                payload,
                priority: options.priority,
                status: QueueStatus::Pending,
                created_at: now_ms(),
                started_at: None,
                completed_at: None,
                retry_count: 0,
                max_retries: options
                    .max_retries
                    .unwrap_or(q.config.default_max_retries),
                timeout: options.timeout.unwrap_or(q.config.default_timeout),
                deduplication_key: options.deduplication_key.clone(),
                result: None,
                error: None,
                last_error: None,
            };
            let (notify, _) = watch::channel(QueueStatus::Pending);
            q.items.insert(
                id.clone(),
                Tracked {
                    item,
                    job,
                    notify,
                    queued_at: Instant::now(),
                    started_at: None,
                },
            );
            q.pending[options.priority.index()].push_back(id.clone());
            if let Some(key) = options.deduplication_key {
                q.dedup.put(key, (id.clone(), Instant::now()));
            }
            q.counters.enqueued += 1;
            id
        };
        trace!(service, operation, item_id = %id, priority = options.priority.as_str(), "enqueued");

        if self.shared.background.is_running() && tokio::runtime::Handle::try_current().is_ok() {
            self.shared.dispatch_service(service);
        }
        Ok(id)
    }

    pub fn get_item(&self, id: &str) -> Option<QueueItem> {
        self.shared
            .all()
            .iter()
            .find_map(|(_, q)| lock(q).items.get(id).map(|t| t.item.clone()))
    }

    fn subscribe_item(&self, id: &str) -> Option<watch::Receiver<QueueStatus>> {
        self.shared
            .all()
            .iter()
            .find_map(|(_, q)| lock(q).items.get(id).map(|t| t.notify.subscribe()))
    }

    /// Waits until the item is terminal. Completed items are returned; failed or timed-out
    /// items return their last error. The item keeps running if the wait gives up.
    pub async fn wait_for_completion(&self, id: &str, timeout: Duration) -> Result<QueueItem> {
        let mut rx = self
            .subscribe_item(id)
            .ok_or_else(|| Error::not_found("queue item", id))?;
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let done = rx.borrow_and_update().is_terminal();
                if done || rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        if waited.is_err() {
            debug!(item_id = id, timeout_ms = timeout.as_millis() as u64, "wait deadline reached");
        }

        let item = self
            .get_item(id)
            .ok_or_else(|| Error::not_found("queue item", id))?;
        match item.status {
            QueueStatus::Completed => Ok(item),
            QueueStatus::Failed | QueueStatus::Timeout => Err(item
                .last_error
                .clone()
                .unwrap_or_else(|| Error::transient(item.error.clone().unwrap_or_default()))),
            QueueStatus::Pending | QueueStatus::Processing => Err(Error::WaitTimeout {
                item_id: id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Enqueues, waits, and deserializes the processor's result.
    pub async fn enqueue_and_wait<T: DeserializeOwned>(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: EnqueueOptions,
        wait_timeout: Duration,
    ) -> Result<T> {
        let id = self.enqueue(service, operation, payload, options)?;
        let item = self.wait_for_completion(&id, wait_timeout).await?;
        Ok(serde_json::from_value(item.result.unwrap_or(Value::Null))?)
    }

    /// One dispatcher tick across every service with a processor. Returns items started.
    pub fn dispatch_pending(&self) -> usize {
        self.shared.dispatch_all()
    }

    /// Removes terminal items past retention and stale deduplication keys.
    pub fn cleanup(&self) -> usize {
        let now = now_ms();
        let mut removed = 0;
        for (service, queue) in self.shared.all() {
            let mut guard = lock(&queue);
            let q = &mut *guard;
            let cutoff = now.saturating_sub(q.config.retention.as_millis() as u64);
            let before = q.items.len();
            q.items.retain(|_, t| {
                !(t.item.status.is_terminal()
                    && t.item.completed_at.is_some_and(|done| done <= cutoff))
            });
            let dropped = before - q.items.len();

            let ttl = q.config.deduplication_ttl;
            let stale: Vec<String> = q
                .dedup
                .iter()
                .filter(|(_, (id, at))| at.elapsed() >= ttl || !q.items.contains_key(id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &stale {
                q.dedup.pop(key);
            }
            if dropped > 0 || !stale.is_empty() {
                debug!(service = %service, items = dropped, dedup_keys = stale.len(), "queue cleanup");
            }
            removed += dropped;
        }
        removed
    }

    pub fn queue_status(&self, service: &str) -> Option<QueueSnapshot> {
        let has_processor = self.has_processor(service);
        self.shared
            .existing(service)
            .map(|q| lock(&q).snapshot(service, has_processor))
    }

    pub fn stats(&self) -> QueueStats {
        let services: Vec<QueueSnapshot> = self
            .shared
            .all()
            .iter()
            .map(|(name, q)| lock(q).snapshot(name, self.has_processor(name)))
            .collect();
        let weighted = |pick: fn(&QueueSnapshot) -> (usize, f64)| {
            let (n, sum) = services.iter().fold((0usize, 0.0), |(n, sum), s| {
                let (count, avg) = pick(s);
                (n + count, sum + avg * count as f64)
            });
            if n == 0 {
                0.0
            } else {
                sum / n as f64
            }
        };
        QueueStats {
            total_pending: services.iter().map(|s| s.pending).sum(),
            total_processing: services.iter().map(|s| s.processing).sum(),
            total_completed: services.iter().map(|s| s.completed).sum(),
            total_failed: services.iter().map(|s| s.failed).sum(),
            total_timed_out: services.iter().map(|s| s.timed_out).sum(),
            avg_wait_ms: weighted(|s| (s.wait_time.count, s.wait_time.avg)),
            avg_processing_ms: weighted(|s| (s.processing_time.count, s.processing_time.avg)),
            throughput_per_sec: services.iter().map(|s| s.throughput_per_sec).sum(),
            services,
        }
    }

    /// Starts the dispatch and cleanup loops. Returns false if already running.
    pub fn start(&self) -> Result<bool> {
        let Some(token) = self.shared.background.begin()? else {
            return Ok(false);
        };
        let cfg = &self.shared.default_config;
        let weak = Arc::downgrade(&self.shared);
        self.shared.background.spawn_periodic(
            &token,
            "queue_dispatch",
            cfg.dispatch_interval,
            move || {
                if let Some(shared) = weak.upgrade() {
                    shared.dispatch_all();
                }
                async {}
            },
        );
        let weak = Arc::downgrade(&self.shared);
        self.shared.background.spawn_periodic(
            &token,
            "queue_cleanup",
            cfg.cleanup_interval,
            move || {
                if let Some(shared) = weak.upgrade() {
                    QueueManager { shared }.cleanup();
                }
                async {}
            },
        );
        info!(
            dispatch_interval_ms = cfg.dispatch_interval.as_millis() as u64,
            "request queue started"
        );
        Ok(true)
    }

    pub async fn stop(&self) -> bool {
        self.shared.background.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.shared.background.is_running()
    }

    /// Dispatches until nothing is pending or processing, or `timeout` passes.
    /// Returns true when the queues emptied.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.shared.dispatch_all();
            let (pending, processing) = self.shared.totals();
            if pending + processing == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pending, processing, "queue drain timed out");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
