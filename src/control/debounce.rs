//! Keyed trailing-edge debouncer.
//!
//! Each key has at most one pending action. Scheduling again before the delay elapses
//! cancels the pending action and restarts the delay, so a burst of changes produces a
//! single action carrying the last one. Once the delay elapses the action runs as its
//! own task: a later `schedule` or `cancel` no longer interrupts it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Pending delayed actions keyed by `K`.
#[derive(Debug)]
pub struct Debouncer<K> {
    delay: Duration,
    pending: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Copy + Send + std::fmt::Debug + 'static,
{
    /// Debouncer with a fixed delay.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Configured delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `action` after the delay unless `key` is scheduled again first.
    ///
    /// Returns `false` (and drops `action`) outside a Tokio runtime.
    pub fn schedule<F>(&self, key: K, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(?key, "Debounced action dropped: no runtime");
            return false;
        };
        let delay = self.delay;
        let spawner = runtime.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            spawner.spawn(action);
        });

        let mut pending = self.pending.lock();
        pending.retain(|_, h| !h.is_finished());
        if let Some(previous) = pending.insert(key, handle) {
            trace!(?key, "Rescheduled debounced action");
            previous.abort();
        }
        true
    }

    /// Cancel the pending action for `key`. Returns `true` if one was waiting.
    pub fn cancel(&self, key: K) -> bool {
        match self.pending.lock().remove(&key) {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Cancel every pending action.
    pub fn cancel_all(&self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }

    /// Whether an action for `key` is still waiting for its delay.
    #[must_use]
    pub fn is_pending(&self, key: K) -> bool {
        self.pending
            .lock()
            .get(&key)
            .is_some_and(|h| !h.is_finished())
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for (_, handle) in self.pending.get_mut().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_runs_last_action_once() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let last = Arc::new(AtomicU32::new(0));
        let runs = Arc::new(AtomicU32::new(0));

        for value in 1..=5 {
            let (last, runs) = (Arc::clone(&last), Arc::clone(&runs));
            debouncer.schedule("lcu", async move {
                last.store(value, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(debouncer.is_pending("lcu"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let runs = Arc::new(AtomicU32::new(0));
        for key in ["lcu", "dcu"] {
            let runs = Arc::clone(&runs);
            debouncer.schedule(key, async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_action() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        debouncer.schedule(1u8, async move {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(debouncer.cancel(1));
        assert!(!debouncer.cancel(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn schedule_outside_runtime_is_refused() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        assert!(!debouncer.schedule(1u8, async {}));
    }
}
