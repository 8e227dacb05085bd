//! Per-key async locks.
//!
//! Serializes network calls for the same cart line so a quantity update and
//! a modality update for one product are never in flight together. Callers
//! queue on the key's lock and run strictly after the holder finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop entries nobody holds or waits on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.handle(key).lock_owned().await
    }

    /// Lock several keys in sorted order so two bulk callers cannot deadlock.
    pub async fn lock_many<'a, I>(&self, keys: I) -> Vec<OwnedMutexGuard<()>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut keys: Vec<&str> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    #[cfg(test)]
    pub fn is_locked(&self, key: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = locks.lock("sku").await;
        let waiter = {
            let locks = locks.clone();
            let order = order.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("sku").await;
                order.lock().unwrap().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        order.lock().unwrap().push("first");
        assert!(locks.is_locked("sku"));
        drop(guard);

        waiter.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(!locks.is_locked("sku"));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
        assert!(locks.is_locked("a"));
        assert!(locks.is_locked("b"));
    }

    #[tokio::test]
    async fn test_lock_many_dedups_keys() {
        let locks = KeyedLocks::new();
        let guards = locks.lock_many(["b", "a", "b"]).await;
        assert_eq!(guards.len(), 2);
    }
}
