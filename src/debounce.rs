//! Per-key debounce scheduler.
//!
//! `schedule(key, delay, action)` arms a timer for `key`. Scheduling the same
//! key again before the timer fires cancels the earlier timer, so only the
//! most recent action for a key runs, once, after a quiet period. Once a
//! timer has fired its action is no longer cancellable; it runs to
//! completion even if the key is scheduled again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Default quiet period before a coalesced mutation is sent.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

struct PendingTimer {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    by_key: HashMap<String, PendingTimer>,
}

#[derive(Clone)]
pub struct Debouncer {
    timers: Arc<Mutex<Timers>>,
    tracker: TaskTracker,
}

impl Debouncer {
    /// Spawned timers are registered on `tracker` so callers can wait for
    /// every scheduled action to settle.
    pub fn new(tracker: TaskTracker) -> Self {
        Self {
            timers: Arc::new(Mutex::new(Timers::default())),
            tracker,
        }
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule<F, Fut>(&self, key: &str, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let generation = {
            let mut timers = self.timers();
            timers.next_generation += 1;
            let generation = timers.next_generation;
            let replaced = timers.by_key.insert(
                key.to_string(),
                PendingTimer {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = replaced {
                previous.cancel.cancel();
                debug!(key, "debounce: superseded pending action");
            }
            generation
        };

        let timers = self.timers.clone();
        let key = key.to_string();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // Claim the slot; a newer schedule may have raced the timer.
            {
                let mut timers = timers.lock().unwrap_or_else(PoisonError::into_inner);
                match timers.by_key.get(&key) {
                    Some(pending) if pending.generation == generation => {
                        timers.by_key.remove(&key);
                    }
                    _ => return,
                }
            }

            debug!(key = %key, "debounce: firing action");
            action().await;
        });
    }

    /// Cancel the pending (not yet fired) action for `key`.
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers().by_key.remove(key) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let mut timers = self.timers();
        let count = timers.by_key.len();
        for (_, pending) in timers.by_key.drain() {
            pending.cancel.cancel();
        }
        count
    }

    #[cfg(test)]
    pub fn is_pending(&self, key: &str) -> bool {
        self.timers().by_key.contains_key(key)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.timers().by_key.len()
    }
}
