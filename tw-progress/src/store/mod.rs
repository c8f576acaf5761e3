//! Persistence collaborator
//!
//! The engine reads the content hierarchy and reads/writes its own progress
//! and attempt rows only through [`ProgressStore`]. Archived content is
//! filtered out by the `*_for_topic` listings but still returned by the
//! single-row getters so callers can tell "archived" from "absent".

mod sqlite;

pub use sqlite::{ArchivableTable, NewTest, SqliteStore};

use crate::attempt::{AnswerKey, NewAttempt, TestAttempt};
use crate::models::{
    ActivitySession, AggregateProgress, ContentType, Section, Subsection, SubsectionProgress,
    TestDefinition, Topic,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tw_common::Result;

/// Rows written together in one transaction
///
/// A subsection update and the section/topic rows recomputed from it land
/// atomically, so no reader sees a topic percentage that disagrees with a
/// subsection it already saw as COMPLETED.
#[derive(Debug, Clone, Default)]
pub struct ProgressWrite {
    pub subsection: Option<SubsectionProgress>,
    pub sections: Vec<AggregateProgress>,
    pub topic: Option<AggregateProgress>,
    /// Attempt update; skipped (and the whole write rolled back) if the
    /// stored attempt is already terminal
    pub attempt: Option<TestAttempt>,
    /// Session audit rows, upserted by session id. A row that already
    /// carries an end reason is never reopened.
    pub sessions: Vec<ActivitySession>,
}

impl ProgressWrite {
    pub fn is_empty(&self) -> bool {
        self.subsection.is_none()
            && self.sections.is_empty()
            && self.topic.is_none()
            && self.attempt.is_none()
            && self.sessions.is_empty()
    }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    // Content hierarchy

    async fn topic(&self, id: i64) -> Result<Option<Topic>>;
    async fn section(&self, id: i64) -> Result<Option<Section>>;
    async fn subsection(&self, id: i64) -> Result<Option<Subsection>>;
    async fn test(&self, id: i64) -> Result<Option<TestDefinition>>;

    /// Non-archived sections ordered by position
    async fn sections_for_topic(&self, topic_id: i64) -> Result<Vec<Section>>;

    /// Non-archived subsections of non-archived sections of the topic
    async fn subsections_for_topic(&self, topic_id: i64) -> Result<Vec<Subsection>>;

    /// Non-archived section-level and topic-level tests of the topic
    async fn tests_for_topic(&self, topic_id: i64) -> Result<Vec<TestDefinition>>;

    async fn answer_key(&self, test_id: i64) -> Result<Vec<AnswerKey>>;

    async fn content_weights(&self) -> Result<HashMap<ContentType, f64>>;

    /// user → group membership → group → topic, every link non-archived
    async fn student_has_topic_access(&self, user_id: i64, topic_id: i64) -> Result<bool>;

    // Progress rows

    async fn subsection_progress(
        &self,
        user_id: i64,
        subsection_id: i64,
    ) -> Result<Option<SubsectionProgress>>;

    async fn subsection_progress_for_topic(
        &self,
        user_id: i64,
        topic_id: i64,
    ) -> Result<Vec<SubsectionProgress>>;

    async fn section_progress(&self, user_id: i64, section_id: i64)
        -> Result<Option<AggregateProgress>>;

    async fn topic_progress(&self, user_id: i64, topic_id: i64) -> Result<Option<AggregateProgress>>;

    /// Apply every row of `write` atomically. Returns false when the write
    /// was rolled back because its attempt is already terminal in storage.
    async fn commit_progress(&self, write: &ProgressWrite) -> Result<bool>;

    /// Newest first, at most `limit` rows
    async fn activity_sessions(
        &self,
        user_id: i64,
        subsection_id: i64,
        limit: u32,
    ) -> Result<Vec<ActivitySession>>;

    // Test attempts

    async fn create_attempt(&self, attempt: &NewAttempt) -> Result<TestAttempt>;
    async fn attempt(&self, id: i64) -> Result<Option<TestAttempt>>;

    /// Most recent STARTED/IN_PROGRESS attempt of the user for the test
    async fn open_attempt(&self, user_id: i64, test_id: i64) -> Result<Option<TestAttempt>>;

    /// Best score per test among scored (COMPLETED/FAILED) attempts
    async fn best_scores(&self, user_id: i64, test_ids: &[i64]) -> Result<HashMap<i64, f64>>;

    /// Scored (COMPLETED/FAILED) attempts of the user for the test
    async fn scored_attempt_count(&self, user_id: i64, test_id: i64) -> Result<u32>;

    async fn open_attempts_for_user(&self, user_id: i64) -> Result<Vec<TestAttempt>>;
    async fn open_attempts(&self) -> Result<Vec<TestAttempt>>;
}
