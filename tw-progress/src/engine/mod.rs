//! Progress engine facade
//!
//! [`Engine`] owns the collaborators (store, cache, clock, event bus) and
//! exposes the inbound operations:
//! - heartbeats and sessions: [`Engine::record_heartbeat`],
//!   [`Engine::close_session`], [`Engine::subsection_status`]
//! - progress reads: [`Engine::get_progress`], [`Engine::check_access`],
//!   [`Engine::check_test_availability`]
//! - test attempts: start, answer, touch, submit, get, and the maintenance
//!   [`Engine::sweep_attempts`]
//!
//! Mutations run on their own task so that a caller abandoning the request
//! cannot leave a half-applied update behind.
//!
//! Lock order, outermost first: (user, subsection) or attempt or
//! (user, test), then user. The user lock covers the session index and the
//! section/topic recompute-and-commit.

mod attempts;
mod heartbeat;
mod progress;

pub use attempts::SweepReport;
pub use heartbeat::{HeartbeatReceipt, SubsectionStatusView};
pub use progress::{SectionView, SubsectionView, TestView, TopicProgressView};

use crate::access::{resolve_path, AccessCacheGuard, CacheCategory};
use crate::cache::CacheClient;
use crate::config::EngineConfig;
use crate::error::{ProgressError, ProgressResult};
use crate::heartbeat::{HeartbeatValidator, RateLimiter};
use crate::locks::KeyedLocks;
use crate::models::ResourceKind;
use crate::session::SessionTracker;
use crate::store::ProgressStore;
use crate::weights::WeightResolver;
use chrono::Duration;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tw_common::events::{EventBus, ProgressEvent};
use tw_common::Clock;

/// Cloneable handle to the progress engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn ProgressStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    weights: WeightResolver,
    rate_limiter: RateLimiter,
    validator: HeartbeatValidator,
    sessions: SessionTracker,
    guard: AccessCacheGuard,
    subsection_locks: KeyedLocks<(i64, i64)>,
    user_locks: KeyedLocks<i64>,
    test_locks: KeyedLocks<(i64, i64)>,
    attempt_locks: KeyedLocks<i64>,
}

impl Engine {
    /// Build an engine from validated configuration and its collaborators
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ProgressStore>,
        cache: Arc<dyn CacheClient>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> ProgressResult<Self> {
        config
            .validate()
            .map_err(|e| ProgressError::InvalidInput(e.to_string()))?;

        let weights = WeightResolver::new(
            store.clone(),
            clock.clone(),
            Duration::seconds(config.cache.weights_ttl_seconds as i64),
        );
        let rate_limiter = RateLimiter::new(cache.clone(), &config.tracking);
        let validator = HeartbeatValidator::new(&config.tracking);
        let sessions = SessionTracker::new(cache.clone(), config.tracking.clone());
        let guard = AccessCacheGuard::new(cache, &config.cache);

        info!(
            rate_limit = config.tracking.rate_limit(),
            max_parallel_sessions = config.tracking.max_parallel_sessions,
            section_threshold = config.progress.section_completion_threshold,
            suspicious_policy = ?config.tracking.suspicious_policy,
            "Progress engine initialized"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                clock,
                events,
                weights,
                rate_limiter,
                validator,
                sessions,
                guard,
                subsection_locks: KeyedLocks::new(),
                user_locks: KeyedLocks::new(),
                test_locks: KeyedLocks::new(),
                attempt_locks: KeyedLocks::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.events.subscribe()
    }

    /// Drop the cached content-weight table so the next recompute reloads it
    pub async fn reload_weights(&self) {
        self.inner.weights.invalidate().await;
    }

    /// Run `op` to completion on its own task, even if the caller stops
    /// polling the returned future
    async fn detached<T, F, Fut>(&self, op: F) -> ProgressResult<T>
    where
        F: FnOnce(Engine) -> Fut,
        Fut: Future<Output = ProgressResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(self.clone()))
            .await
            .map_err(|e| ProgressError::Internal(format!("engine task failed: {}", e)))?
    }

    fn emit_all(&self, events: Vec<ProgressEvent>) {
        for event in events {
            self.inner.events.emit_lossy(event);
        }
    }

    /// `CheckAccess(user, kind, id)`
    ///
    /// Topic: a non-archived group of the student grants the topic.
    /// Section (and everything under it): topic access, and the section is
    /// unlocked for the student. Archived resources are never accessible.
    /// Decisions are cached for the access TTL.
    pub async fn check_access(
        &self,
        user_id: i64,
        kind: ResourceKind,
        id: i64,
    ) -> ProgressResult<bool> {
        let path = resolve_path(self.inner.store.as_ref(), kind, id).await?;
        if path.archived {
            return Ok(false);
        }
        if !self.topic_access(user_id, path.topic_id).await? {
            return Ok(false);
        }
        match path.section_id {
            Some(section_id) => self.section_access(user_id, path.topic_id, section_id).await,
            None => Ok(true),
        }
    }

    /// Like [`Engine::check_access`], failing with `AccessDenied`
    async fn require_access(&self, user_id: i64, kind: ResourceKind, id: i64) -> ProgressResult<()> {
        if self.check_access(user_id, kind, id).await? {
            Ok(())
        } else {
            Err(ProgressError::AccessDenied { kind, id })
        }
    }

    async fn topic_access(&self, user_id: i64, topic_id: i64) -> ProgressResult<bool> {
        let store = self.inner.store.clone();
        self.inner
            .guard
            .get_or_compute(
                CacheCategory::Access,
                &format!("topic:{}:{}", user_id, topic_id),
                || async move {
                    crate::access::read(|| store.student_has_topic_access(user_id, topic_id)).await
                },
            )
            .await
    }

    async fn section_access(
        &self,
        user_id: i64,
        topic_id: i64,
        section_id: i64,
    ) -> ProgressResult<bool> {
        self.inner
            .guard
            .get_or_compute(
                CacheCategory::Access,
                &format!("section:{}:{}", user_id, section_id),
                || async {
                    let view = self.topic_view(user_id, topic_id).await?;
                    Ok(view
                        .sections
                        .iter()
                        .find(|s| s.section_id == section_id)
                        .is_some_and(|s| s.available))
                },
            )
            .await
    }
}
