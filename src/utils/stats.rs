//! Bounded sample windows and percentile math.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Nearest-rank percentile over an ascending slice: `index = ceil(p/100 * n) - 1`.
///
/// Returns 0.0 for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p * n as f64 / 100.0).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

/// Summary of a latency sample set, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencyPercentiles {
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a f64>) -> Self {
        let mut sorted: Vec<f64> = samples.into_iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return Self::default();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();
        Self {
            count: sorted.len(),
            avg: sum / sorted.len() as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Fixed-capacity FIFO window; pushing past capacity evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    values: VecDeque<T>,
    capacity: usize,
}

impl<T> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.values.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.values.back()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Drops samples from the front while `pred` holds.
    pub fn evict_while(&mut self, mut pred: impl FnMut(&T) -> bool) {
        while let Some(front) = self.values.front() {
            if pred(front) {
                self.values.pop_front();
            } else {
                break;
            }
        }
    }
}

impl SlidingWindow<f64> {
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.values.iter().sum::<f64>() / self.values.len() as f64
        }
    }

    pub fn percentiles(&self) -> LatencyPercentiles {
        LatencyPercentiles::from_samples(self.values.iter())
    }
}

/// Completion timestamps used to derive a per-second rate over a trailing period.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    events: SlidingWindow<Instant>,
    period: Duration,
}

impl ThroughputWindow {
    pub fn new(capacity: usize, period: Duration) -> Self {
        Self {
            events: SlidingWindow::new(capacity),
            period,
        }
    }

    pub fn record(&mut self) {
        self.events.push(Instant::now());
    }

    /// Events per second over the trailing period.
    pub fn rate_per_sec(&mut self) -> f64 {
        let period = self.period;
        let now = Instant::now();
        self.events.evict_while(|t| now.duration_since(*t) > period);
        let secs = period.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.events.len() as f64 / secs
        }
    }
}
