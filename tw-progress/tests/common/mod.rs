//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tw_common::db::init_database;
use tw_common::events::{EventBus, ProgressEvent};
use tw_common::{Clock, ManualClock};
use tw_progress::attempt::{AnswerKey, NewAttempt, TestAttempt};
use tw_progress::cache::MemoryCache;
use tw_progress::config::EngineConfig;
use tw_progress::models::{
    ActivitySession, AggregateProgress, ContentType, Section, Subsection, SubsectionKind,
    SubsectionProgress, TestDefinition, Topic,
};
use tw_progress::store::{ProgressStore, ProgressWrite, SqliteStore};
use tw_progress::{Engine, HeartbeatReceipt, ProgressResult};

pub const STUDENT: i64 = 42;
pub const OUTSIDER: i64 = 7;

pub struct Harness {
    pub engine: Engine,
    /// Direct access for seeding and assertions
    pub store: Arc<SqliteStore>,
    /// The store the engine sees
    pub faults: Arc<FaultyStore>,
    pub clock: Arc<ManualClock>,
    pub events: EventBus,
    _dir: TempDir,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 8, 0, 0).unwrap()
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("progress.db")).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    let faults = Arc::new(FaultyStore::new(store.clone()));
    let clock = Arc::new(ManualClock::new(start_time()));
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let events = EventBus::new(1024);
    let engine = Engine::new(config, faults.clone(), cache, clock.clone(), events.clone()).unwrap();

    Harness {
        engine,
        store,
        faults,
        clock,
        events,
        _dir: dir,
    }
}

/// Store that delegates to SQLite but can be told to fail commits
pub struct FaultyStore {
    inner: Arc<SqliteStore>,
    failing_commits: AtomicU32,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            failing_commits: AtomicU32::new(0),
        }
    }

    /// The next `count` calls to `commit_progress` fail without writing
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProgressStore for FaultyStore {
    async fn topic(&self, id: i64) -> tw_common::Result<Option<Topic>> {
        self.inner.topic(id).await
    }

    async fn section(&self, id: i64) -> tw_common::Result<Option<Section>> {
        self.inner.section(id).await
    }

    async fn subsection(&self, id: i64) -> tw_common::Result<Option<Subsection>> {
        self.inner.subsection(id).await
    }

    async fn test(&self, id: i64) -> tw_common::Result<Option<TestDefinition>> {
        self.inner.test(id).await
    }

    async fn sections_for_topic(&self, topic_id: i64) -> tw_common::Result<Vec<Section>> {
        self.inner.sections_for_topic(topic_id).await
    }

    async fn subsections_for_topic(&self, topic_id: i64) -> tw_common::Result<Vec<Subsection>> {
        self.inner.subsections_for_topic(topic_id).await
    }

    async fn tests_for_topic(&self, topic_id: i64) -> tw_common::Result<Vec<TestDefinition>> {
        self.inner.tests_for_topic(topic_id).await
    }

    async fn answer_key(&self, test_id: i64) -> tw_common::Result<Vec<AnswerKey>> {
        self.inner.answer_key(test_id).await
    }

    async fn content_weights(&self) -> tw_common::Result<HashMap<ContentType, f64>> {
        self.inner.content_weights().await
    }

    async fn student_has_topic_access(&self, user_id: i64, topic_id: i64) -> tw_common::Result<bool> {
        self.inner.student_has_topic_access(user_id, topic_id).await
    }

    async fn subsection_progress(
        &self,
        user_id: i64,
        subsection_id: i64,
    ) -> tw_common::Result<Option<SubsectionProgress>> {
        self.inner.subsection_progress(user_id, subsection_id).await
    }

    async fn subsection_progress_for_topic(
        &self,
        user_id: i64,
        topic_id: i64,
    ) -> tw_common::Result<Vec<SubsectionProgress>> {
        self.inner.subsection_progress_for_topic(user_id, topic_id).await
    }

    async fn section_progress(
        &self,
        user_id: i64,
        section_id: i64,
    ) -> tw_common::Result<Option<AggregateProgress>> {
        self.inner.section_progress(user_id, section_id).await
    }

    async fn topic_progress(
        &self,
        user_id: i64,
        topic_id: i64,
    ) -> tw_common::Result<Option<AggregateProgress>> {
        self.inner.topic_progress(user_id, topic_id).await
    }

    async fn commit_progress(&self, write: &ProgressWrite) -> tw_common::Result<bool> {
        let failing = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(tw_common::Error::Internal("disk full".to_string()));
        }
        self.inner.commit_progress(write).await
    }

    async fn activity_sessions(
        &self,
        user_id: i64,
        subsection_id: i64,
        limit: u32,
    ) -> tw_common::Result<Vec<ActivitySession>> {
        self.inner.activity_sessions(user_id, subsection_id, limit).await
    }

    async fn create_attempt(&self, attempt: &NewAttempt) -> tw_common::Result<TestAttempt> {
        self.inner.create_attempt(attempt).await
    }

    async fn attempt(&self, id: i64) -> tw_common::Result<Option<TestAttempt>> {
        self.inner.attempt(id).await
    }

    async fn open_attempt(&self, user_id: i64, test_id: i64) -> tw_common::Result<Option<TestAttempt>> {
        self.inner.open_attempt(user_id, test_id).await
    }

    async fn best_scores(
        &self,
        user_id: i64,
        test_ids: &[i64],
    ) -> tw_common::Result<HashMap<i64, f64>> {
        self.inner.best_scores(user_id, test_ids).await
    }

    async fn scored_attempt_count(&self, user_id: i64, test_id: i64) -> tw_common::Result<u32> {
        self.inner.scored_attempt_count(user_id, test_id).await
    }

    async fn open_attempts_for_user(&self, user_id: i64) -> tw_common::Result<Vec<TestAttempt>> {
        self.inner.open_attempts_for_user(user_id).await
    }

    async fn open_attempts(&self) -> tw_common::Result<Vec<TestAttempt>> {
        self.inner.open_attempts().await
    }
}

/// A topic granted to [`STUDENT`] through one group
pub struct Course {
    pub topic_id: i64,
    pub sections: Vec<i64>,
    /// Subsections per section, in order
    pub subsections: Vec<Vec<i64>>,
}

impl Course {
    pub fn subsection(&self, section: usize, index: usize) -> i64 {
        self.subsections[section][index]
    }
}

/// `layout[i]` text subsections with `min_time` seconds in section `i`
pub async fn course(store: &SqliteStore, layout: &[usize], min_time: Option<i64>) -> Course {
    let topic_id = store.insert_topic("Rust basics").await.unwrap();
    let group = store.insert_group("Cohort A").await.unwrap();
    store.add_student(group, STUDENT).await.unwrap();
    store.grant_topic(group, topic_id).await.unwrap();

    let mut sections = Vec::new();
    let mut subsections = Vec::new();
    for (i, count) in layout.iter().enumerate() {
        let section_id = store
            .insert_section(topic_id, &format!("Section {}", i + 1), i as i64, 1.0)
            .await
            .unwrap();
        let mut ids = Vec::new();
        for j in 0..*count {
            ids.push(
                store
                    .insert_subsection(
                        section_id,
                        &format!("Part {}.{}", i + 1, j + 1),
                        SubsectionKind::Text,
                        min_time,
                        None,
                    )
                    .await
                    .unwrap(),
            );
        }
        sections.push(section_id);
        subsections.push(ids);
    }

    Course {
        topic_id,
        sections,
        subsections,
    }
}

/// Heartbeat stamped with the current (manual) time
pub async fn beat(h: &Harness, user_id: i64, subsection_id: i64) -> ProgressResult<HeartbeatReceipt> {
    let now = h.clock.now();
    h.engine.record_heartbeat(user_id, subsection_id, now).await
}

/// Send heartbeats `interval` seconds apart until `seconds` of tracked
/// time have been credited (the first heartbeat credits nothing)
pub async fn study(h: &Harness, user_id: i64, subsection_id: i64, interval: f64, seconds: f64) {
    let mut credited = 0.0;
    beat(h, user_id, subsection_id).await.unwrap();
    while credited < seconds {
        h.clock.advance_secs(interval);
        let receipt = beat(h, user_id, subsection_id).await.unwrap();
        assert!(receipt.accepted, "heartbeat rejected: {:?}", receipt.reason);
        credited += receipt.time_credited_seconds;
    }
}

/// Drain every event currently queued for `rx`
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
