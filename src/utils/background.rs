//! Cancellable periodic loops owned by a component.

use crate::utils::lock;
use crate::{Error, ErrorContext, Result};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

pub(crate) struct Background {
    name: &'static str,
    token: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl Background {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            token: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        lock(&self.token).is_some()
    }

    /// Marks the component running and returns the token its loops watch.
    ///
    /// `Ok(None)` means it was already running. Fails outside a tokio runtime.
    pub(crate) fn begin(&self) -> Result<Option<CancellationToken>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::runtime_with_context(
                "background loops require a tokio runtime",
                ErrorContext::new().with_source(self.name),
            ));
        }
        let mut slot = lock(&self.token);
        if slot.is_some() {
            return Ok(None);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        info!(component = self.name, "background loops started");
        Ok(Some(token))
    }

    /// Runs `tick` every `period` until `token` is cancelled. The first tick fires after one period.
    pub(crate) fn spawn_periodic<F, Fut>(
        &self,
        token: &CancellationToken,
        loop_name: &'static str,
        period: Duration,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = token.clone();
        let component = self.name;
        let period = period.max(Duration::from_millis(1));
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!(component, loop_name, "background loop exited");
        });
    }

    /// Cancels the loops and waits for them to exit. Returns false if nothing was running.
    pub(crate) async fn stop(&self) -> bool {
        let Some(token) = lock(&self.token).take() else {
            return false;
        };
        token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        info!(component = self.name, "background loops stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins() {
        let bg = Background::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let token = bg.begin().unwrap().unwrap();
        let t = Arc::clone(&ticks);
        bg.spawn_periodic(&token, "tick", Duration::from_millis(5), move || {
            let t = Arc::clone(&t);
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(bg.begin().unwrap().is_none());
        assert!(bg.is_running());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(bg.stop().await);
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop > 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
        assert!(!bg.stop().await);
        assert!(bg.begin().unwrap().is_some());
        bg.stop().await;
    }

    #[test]
    fn test_begin_outside_runtime_fails() {
        let bg = Background::new("test");
        assert!(bg.begin().is_err());
    }
}
