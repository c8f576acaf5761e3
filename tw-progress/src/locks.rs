//! Per-key async locks
//!
//! Requests for the same key run one at a time in arrival order (tokio's
//! mutex is FIFO-fair); requests for different keys never contend. Idle
//! keys are dropped from the map when their last guard is released.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type LockMap<K> = Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>;

#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    locks: Arc<LockMap<K>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let guard = mutex.lock_owned().await;
        KeyGuard {
            key: Some(key),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive access to one key; released on drop
pub struct KeyGuard<K: Eq + Hash + Clone> {
    key: Option<K>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap<K>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // Release the key before inspecting reference counts
        drop(self.guard.take());

        if let Some(key) = self.key.take() {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Only the map's own handle left: nobody holds or awaits this key
            if map.get(&key).is_some_and(|m| Arc::strong_count(m) == 1) {
                map.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized_in_arrival_order() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.lock(1).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(1).await;
                order.lock().unwrap().push(i);
            }));
            // Let each task reach the queue before spawning the next
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::<(i64, i64)>::new();
        let _a = locks.lock((1, 1)).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock((1, 2))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_keys_are_pruned() {
        let locks = KeyedLocks::<u32>::new();
        {
            let _guard = locks.lock(7).await;
            assert_eq!(locks.active_keys(), 1);
        }
        assert_eq!(locks.active_keys(), 0);
    }
}
