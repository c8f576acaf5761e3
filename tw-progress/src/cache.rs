//! Cache collaborator
//!
//! Key-value store with per-entry TTL and atomic increment. Values are JSON
//! so that any backend (in-process map, Redis, memcached) can hold them.
//! The cache is never a source of truth: every reader must be able to
//! recompute a value when its entry is absent.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tw_common::retry::Transient;
use tw_common::Clock;

/// Cache backend failure
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend unreachable or timed out
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// Stored value is not what the reader expected
    #[error("cache value for '{key}' is malformed: {reason}")]
    Malformed { key: String, reason: String },
}

impl Transient for CacheError {
    fn is_transient(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Live value for `key`, if any
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    /// Store `value` for `ttl`, replacing any existing entry
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()>;

    /// Atomically add `delta` to an integer entry and return the new value.
    ///
    /// A missing or expired entry starts from 0 and receives `ttl`; an
    /// existing entry keeps its original expiry.
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64>;

    async fn delete(&self, key: &str) -> CacheResult<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: DateTime<Utc>,
}

/// Purge expired entries once the map grows past this many keys
const PURGE_THRESHOLD: usize = 4096;

/// In-process cache driven by the injected clock
#[derive(Debug)]
pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, now: DateTime<Utc>) {
        if entries.len() > PURGE_THRESHOLD {
            entries.retain(|_, entry| entry.expires_at > now);
        }
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()> {
        let now = self.clock.now();
        let mut entries = self.lock();
        Self::purge_expired(&mut entries, now);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
        let now = self.clock.now();
        let mut entries = self.lock();

        let (current, expires_at) = match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                let current = entry.value.as_i64().ok_or_else(|| CacheError::Malformed {
                    key: key.to_string(),
                    reason: "not an integer".to_string(),
                })?;
                (current, entry.expires_at)
            }
            _ => (0, now + ttl),
        };

        let next = current.saturating_add(delta);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::from(next),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tw_common::ManualClock;

    fn cache() -> (Arc<ManualClock>, MemoryCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let cache = MemoryCache::new(clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let (clock, cache) = cache();
        cache
            .set("access:topic:1:2", json!(true), Duration::seconds(600))
            .await
            .unwrap();

        clock.advance(Duration::seconds(599));
        assert_eq!(cache.get("access:topic:1:2").await.unwrap(), Some(json!(true)));

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get("access:topic:1:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_keeps_original_expiry() {
        let (clock, cache) = cache();
        let ttl = Duration::seconds(60);

        assert_eq!(cache.incr("n", 1, ttl).await.unwrap(), 1);
        clock.advance(Duration::seconds(40));
        assert_eq!(cache.incr("n", 2, ttl).await.unwrap(), 3);

        // Window opened at t=0, so the counter resets at t=60
        clock.advance(Duration::seconds(20));
        assert_eq!(cache.incr("n", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_on_non_integer_is_malformed() {
        let (_clock, cache) = cache();
        cache.set("k", json!("text"), Duration::seconds(5)).await.unwrap();
        assert!(matches!(
            cache.incr("k", 1, Duration::seconds(5)).await,
            Err(CacheError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let (_clock, cache) = cache();
        cache.set("k", json!(1), Duration::seconds(5)).await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }
}
