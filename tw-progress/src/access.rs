//! Access Cache Guard
//!
//! Access decisions and computed progress are cached for a short, per
//! category TTL. Entries are never invalidated on writes: a cached answer
//! can be stale for at most one TTL, and a missing or unreadable entry
//! always falls through to the authoritative computation.

use crate::cache::CacheClient;
use crate::config::CacheConfig;
use crate::error::{ProgressError, ProgressResult};
use crate::models::ResourceKind;
use crate::store::ProgressStore;
use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use tw_common::retry::retry_once;

/// What a cached value is, which decides its TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCategory {
    Access,
    Progress,
}

impl CacheCategory {
    fn prefix(self) -> &'static str {
        match self {
            CacheCategory::Access => "access",
            CacheCategory::Progress => "progress",
        }
    }
}

pub struct AccessCacheGuard {
    cache: Arc<dyn CacheClient>,
    access_ttl: Duration,
    progress_ttl: Duration,
}

impl AccessCacheGuard {
    pub fn new(cache: Arc<dyn CacheClient>, config: &CacheConfig) -> Self {
        Self {
            cache,
            access_ttl: Duration::seconds(config.access_ttl_seconds as i64),
            progress_ttl: Duration::seconds(config.progress_ttl_seconds as i64),
        }
    }

    pub fn ttl(&self, category: CacheCategory) -> Duration {
        match category {
            CacheCategory::Access => self.access_ttl,
            CacheCategory::Progress => self.progress_ttl,
        }
    }

    /// Cached value for `key`, or the result of `compute` (which is then
    /// cached). Cache failures only cost the computation.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        category: CacheCategory,
        key: &str,
        compute: F,
    ) -> ProgressResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProgressResult<T>>,
    {
        let full_key = format!("{}:{}", category.prefix(), key);

        match retry_once("cache guard read", || self.cache.get(&full_key)).await {
            Ok(Some(value)) => match serde_json::from_value::<T>(value) {
                Ok(hit) => {
                    debug!(key = %full_key, "Cache hit");
                    return Ok(hit);
                }
                Err(e) => warn!(key = %full_key, error = %e, "Ignoring malformed cache entry"),
            },
            Ok(None) => debug!(key = %full_key, "Cache miss"),
            Err(e) => warn!(key = %full_key, error = %e, "Cache read failed, computing"),
        }

        let value = compute().await?;

        match serde_json::to_value(&value) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&full_key, json, self.ttl(category)).await {
                    warn!(key = %full_key, error = %e, "Failed to cache computed value");
                }
            }
            Err(e) => warn!(key = %full_key, error = %e, "Computed value not cacheable"),
        }

        Ok(value)
    }
}

/// Where a resource sits in the content hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePath {
    pub topic_id: i64,
    /// Section the resource belongs to (or is)
    pub section_id: Option<i64>,
    /// The resource or one of its ancestors is archived
    pub archived: bool,
}

/// Resolve a resource to its topic and section.
///
/// Absent resources are `NotFound`; archived ones resolve with
/// `archived = true` so callers can deny rather than fail.
pub async fn resolve_path(
    store: &dyn ProgressStore,
    kind: ResourceKind,
    id: i64,
) -> ProgressResult<ResourcePath> {
    match kind {
        ResourceKind::Topic => topic_path(store, id).await,
        ResourceKind::Section => section_path(store, id).await,
        ResourceKind::Subsection => {
            let subsection = read(|| store.subsection(id))
                .await?
                .ok_or_else(|| ProgressError::not_found(kind, id))?;
            let parent = section_path(store, subsection.section_id).await?;
            Ok(ResourcePath {
                archived: parent.archived || subsection.is_archived,
                ..parent
            })
        }
        ResourceKind::Test => test_path(store, id).await,
        ResourceKind::Attempt => {
            let attempt = read(|| store.attempt(id))
                .await?
                .ok_or_else(|| ProgressError::not_found(kind, id))?;
            test_path(store, attempt.test_id).await
        }
    }
}

async fn topic_path(store: &dyn ProgressStore, id: i64) -> ProgressResult<ResourcePath> {
    let topic = read(|| store.topic(id))
        .await?
        .ok_or_else(|| ProgressError::not_found(ResourceKind::Topic, id))?;
    Ok(ResourcePath {
        topic_id: topic.id,
        section_id: None,
        archived: topic.is_archived,
    })
}

async fn section_path(store: &dyn ProgressStore, id: i64) -> ProgressResult<ResourcePath> {
    let section = read(|| store.section(id))
        .await?
        .ok_or_else(|| ProgressError::not_found(ResourceKind::Section, id))?;
    let topic = topic_path(store, section.topic_id).await?;
    Ok(ResourcePath {
        topic_id: topic.topic_id,
        section_id: Some(section.id),
        archived: topic.archived || section.is_archived,
    })
}

async fn test_path(store: &dyn ProgressStore, id: i64) -> ProgressResult<ResourcePath> {
    let test = read(|| store.test(id))
        .await?
        .ok_or_else(|| ProgressError::not_found(ResourceKind::Test, id))?;
    let parent = match (test.section_id, test.topic_id) {
        (Some(section_id), _) => section_path(store, section_id).await?,
        (None, Some(topic_id)) => topic_path(store, topic_id).await?,
        (None, None) => {
            return Err(ProgressError::Internal(format!(
                "test {} is attached to neither a section nor a topic",
                id
            )))
        }
    };
    Ok(ResourcePath {
        archived: parent.archived || test.is_archived,
        ..parent
    })
}

/// Idempotent store read with one retry on transient failure
pub(crate) async fn read<T, F, Fut>(operation: F) -> ProgressResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = tw_common::Result<T>>,
{
    Ok(retry_once("store read", operation).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheResult, MemoryCache};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tw_common::ManualClock;

    fn guard_with_clock() -> (AccessCacheGuard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        (AccessCacheGuard::new(cache, &CacheConfig::default()), clock)
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let (guard, _clock) = guard_with_clock();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let allowed = guard
                .get_or_compute(CacheCategory::Access, "topic:1:2", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                })
                .await
                .unwrap();
            assert!(allowed);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_recomputed_after_category_ttl() {
        let (guard, clock) = guard_with_clock();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let compute = move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) };

        assert_eq!(guard.get_or_compute(CacheCategory::Progress, "k", compute).await.unwrap(), 1);

        // Progress TTL is shorter than access TTL
        clock.advance(Duration::seconds(299));
        assert_eq!(guard.get_or_compute(CacheCategory::Progress, "k", compute).await.unwrap(), 1);
        clock.advance(Duration::seconds(2));
        assert_eq!(guard.get_or_compute(CacheCategory::Progress, "k", compute).await.unwrap(), 2);

        // Same key in the other category is a separate entry
        assert_eq!(guard.get_or_compute(CacheCategory::Access, "k", compute).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_compute_error_is_not_cached() {
        let (guard, _clock) = guard_with_clock();

        let err = guard
            .get_or_compute::<bool, _, _>(CacheCategory::Access, "k", || async {
                Err(ProgressError::InvalidInput("boom".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let ok = guard
            .get_or_compute(CacheCategory::Access, "k", || async { Ok(false) })
            .await
            .unwrap();
        assert!(!ok);
    }

    /// Backend that is always down
    struct DownCache {
        reads: AtomicU32,
    }

    #[async_trait]
    impl CacheClient for DownCache {
        async fn get(&self, _key: &str) -> CacheResult<Option<Value>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn incr(&self, _key: &str, _delta: i64, _ttl: Duration) -> CacheResult<i64> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_cache_falls_back_to_compute() {
        let cache = Arc::new(DownCache {
            reads: AtomicU32::new(0),
        });
        let guard = AccessCacheGuard::new(cache.clone(), &CacheConfig::default());

        let value = guard
            .get_or_compute(CacheCategory::Access, "topic:1:1", || async { Ok(true) })
            .await
            .unwrap();

        assert!(value);
        // One read plus one retry
        assert_eq!(cache.reads.load(Ordering::SeqCst), 2);
    }
}
