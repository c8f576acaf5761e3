//! Content-type weight resolution
//!
//! Weights change rarely but are read on every recomputation, so the whole
//! table is held as a snapshot and refreshed lazily once its TTL runs out.
//! Lookups never fail: a missing entry, or a table that could not be
//! loaded, resolves to the caller's default.

use crate::models::ContentType;
use crate::store::ProgressStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use tw_common::retry::retry_once;
use tw_common::Clock;

/// Immutable snapshot of the weight table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightTable {
    weights: HashMap<ContentType, f64>,
}

impl WeightTable {
    pub fn new(weights: HashMap<ContentType, f64>) -> Self {
        Self { weights }
    }

    /// Weight for `content_type`, or `default` if absent or not a finite number
    pub fn get(&self, content_type: ContentType, default: f64) -> f64 {
        match self.weights.get(&content_type) {
            Some(weight) if weight.is_finite() => *weight,
            _ => default,
        }
    }
}

struct Snapshot {
    table: Arc<WeightTable>,
    loaded_at: DateTime<Utc>,
}

pub struct WeightResolver {
    store: Arc<dyn ProgressStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    snapshot: RwLock<Option<Snapshot>>,
}

impl WeightResolver {
    pub fn new(store: Arc<dyn ProgressStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            clock,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    /// `weight(content_type, default)`
    pub async fn weight(&self, content_type: ContentType, default: f64) -> f64 {
        self.table().await.get(content_type, default)
    }

    /// Current snapshot, reloading it if older than the TTL
    pub async fn table(&self) -> Arc<WeightTable> {
        let now = self.clock.now();
        {
            let snapshot = self.snapshot.read().await;
            if let Some(s) = snapshot.as_ref() {
                if now - s.loaded_at < self.ttl {
                    return s.table.clone();
                }
            }
        }

        let mut snapshot = self.snapshot.write().await;
        // Another task may have refreshed while we waited for the write lock
        if let Some(s) = snapshot.as_ref() {
            if now - s.loaded_at < self.ttl {
                return s.table.clone();
            }
        }

        let store = self.store.clone();
        match retry_once("load content weights", || {
            let store = store.clone();
            async move { store.content_weights().await }
        })
        .await
        {
            Ok(weights) => {
                debug!(entries = weights.len(), "Content weight table refreshed");
                let table = Arc::new(WeightTable::new(weights));
                *snapshot = Some(Snapshot {
                    table: table.clone(),
                    loaded_at: now,
                });
                table
            }
            Err(e) => {
                // Serve the previous snapshot (or defaults) and try again next call
                warn!(error = %e, "Failed to load content weights, using last known values");
                snapshot
                    .as_ref()
                    .map(|s| s.table.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Drop the snapshot so the next lookup reloads it
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::TimeZone;
    use tw_common::db::init_database;
    use tw_common::ManualClock;

    async fn resolver() -> (tempfile::TempDir, Arc<SqliteStore>, Arc<ManualClock>, WeightResolver) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_database(&dir.path().join("weights.db")).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let resolver = WeightResolver::new(store.clone(), clock.clone(), Duration::hours(1));
        (dir, store, clock, resolver)
    }

    #[tokio::test]
    async fn test_snapshot_refreshes_once_ttl_passes() {
        let (_dir, store, clock, resolver) = resolver().await;
        store
            .set_content_weight(ContentType::SubsectionVideo, 2.0)
            .await
            .unwrap();
        assert_eq!(resolver.weight(ContentType::SubsectionVideo, 1.0).await, 2.0);

        store
            .set_content_weight(ContentType::SubsectionVideo, 4.0)
            .await
            .unwrap();
        clock.advance(Duration::minutes(59));
        assert_eq!(resolver.weight(ContentType::SubsectionVideo, 1.0).await, 2.0);

        clock.advance(Duration::minutes(2));
        assert_eq!(resolver.weight(ContentType::SubsectionVideo, 1.0).await, 4.0);
    }

    #[tokio::test]
    async fn test_weight_falls_back_to_default_for_missing_row() {
        let (_dir, store, _clock, resolver) = resolver().await;
        sqlx::query("DELETE FROM content_weights WHERE content_type = 'TEST_HINTED'")
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(resolver.weight(ContentType::TestHinted, 0.5).await, 0.5);
        assert_eq!(resolver.weight(ContentType::SubsectionText, 0.5).await, 1.0);
    }

    #[test]
    fn test_missing_entry_resolves_to_default() {
        let mut weights = HashMap::new();
        weights.insert(ContentType::SubsectionVideo, 2.0);
        weights.insert(ContentType::SubsectionPdf, f64::NAN);
        let table = WeightTable::new(weights);

        assert_eq!(table.get(ContentType::SubsectionVideo, 1.0), 2.0);
        assert_eq!(table.get(ContentType::SubsectionText, 1.0), 1.0);
        assert_eq!(table.get(ContentType::SubsectionPdf, 0.5), 0.5);
    }
}
