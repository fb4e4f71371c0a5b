//! Small shared helpers: clock, lock access, bounded windows, percentile math.

pub(crate) mod background;
pub mod duration_ms;
pub mod stats;

pub use stats::{percentile, LatencyPercentiles, SlidingWindow, ThroughputWindow};

use once_cell::sync::Lazy;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock anchor taken once per process; later readings advance it by a monotonic delta.
static CLOCK_ANCHOR: Lazy<(Instant, u64)> = Lazy::new(|| {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    (Instant::now(), epoch_ms)
});

/// Milliseconds since the Unix epoch, never decreasing within a process.
pub fn now_ms() -> u64 {
    let (anchor, epoch_ms) = *CLOCK_ANCHOR;
    epoch_ms + anchor.elapsed().as_millis() as u64
}

/// Duration as fractional milliseconds, exact for whole-millisecond values.
pub fn millis_f64(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

// Poisoning only means another thread panicked mid-update; the records guarded here are
// plain counters and stay usable.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|p| p.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|p| p.into_inner())
}

/// Short random identifier, used for span ids.
pub(crate) fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }

    #[test]
    fn test_short_id_length_and_uniqueness() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        use std::sync::Arc;
        let m = Arc::new(Mutex::new(1));
        let m2 = Arc::clone(&m);
        let _ = std::thread::spawn(move || {
            let _g = m2.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(m.is_poisoned());
        *lock(&m) += 1;
        assert_eq!(*lock(&m), 2);
    }
}
