//! SQLite implementation of [`ProgressStore`]
//!
//! Timestamps are stored as RFC3339 TEXT; attempt answers as a JSON object
//! keyed by question id.

use super::{ProgressStore, ProgressWrite};
use crate::attempt::{AnswerKey, NewAttempt, QuestionType, TestAttempt};
use crate::models::{
    ActivitySession, AggregateProgress, ContentType, Section, Subsection, SubsectionKind, SubsectionProgress,
    TestDefinition, TestKind, Topic,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;
use tw_common::time::parse_timestamp;
use tw_common::{AttemptStatus, Error, ProgressStatus, Result};
use uuid::Uuid;

const SUBSECTION_COLUMNS: &str =
    "id, section_id, title, kind, position, min_time_seconds, weight, is_archived";
const TEST_COLUMNS: &str = "id, title, kind, section_id, topic_id, passing_score, \
     required_completion, duration_minutes, max_attempts, is_archived";
const ATTEMPT_COLUMNS: &str = "id, test_id, user_id, status, started_at, expires_at, \
     last_activity_at, auto_extend_count, answers, score, completed_at";
const SESSION_COLUMNS: &str = "session_id, user_id, subsection_id, started_at, \
     last_activity_at, ended_at, end_reason, accumulated_seconds, flagged_seconds, \
     heartbeat_count, is_suspicious, interval_stddev";
const OPEN_STATUSES: &str = "('STARTED', 'IN_PROGRESS')";
const SCORED_STATUSES: &str = "('COMPLETED', 'FAILED')";

/// Catalog values for [`SqliteStore::insert_test`]
#[derive(Debug, Clone)]
pub struct NewTest {
    pub title: String,
    pub kind: TestKind,
    pub section_id: Option<i64>,
    pub topic_id: Option<i64>,
    pub passing_score: f64,
    pub required_completion: Option<f64>,
    pub duration_minutes: Option<i64>,
    pub max_attempts: Option<u32>,
}

impl NewTest {
    fn new(kind: TestKind, section_id: Option<i64>, topic_id: Option<i64>) -> Self {
        Self {
            title: format!("{:?} test", kind),
            kind,
            section_id,
            topic_id,
            passing_score: 60.0,
            required_completion: None,
            duration_minutes: None,
            max_attempts: None,
        }
    }

    pub fn hinted(section_id: i64) -> Self {
        Self::new(TestKind::Hinted, Some(section_id), None)
    }

    pub fn section_final(section_id: i64) -> Self {
        Self::new(TestKind::SectionFinal, Some(section_id), None)
    }

    pub fn global_final(topic_id: i64) -> Self {
        Self::new(TestKind::GlobalFinal, None, Some(topic_id))
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Catalog administration. The engine itself never writes these tables.

    pub async fn insert_topic(&self, title: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO topics (title) VALUES (?)")
            .bind(title)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_section(
        &self,
        topic_id: i64,
        title: &str,
        position: i64,
        weight: f64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO sections (topic_id, title, position, weight) VALUES (?, ?, ?, ?)",
        )
        .bind(topic_id)
        .bind(title)
        .bind(position)
        .bind(weight)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_subsection(
        &self,
        section_id: i64,
        title: &str,
        kind: SubsectionKind,
        min_time_seconds: Option<i64>,
        weight: Option<f64>,
    ) -> Result<i64> {
        let position: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subsections WHERE section_id = ?")
                .bind(section_id)
                .fetch_one(&self.pool)
                .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO subsections (section_id, title, kind, position, min_time_seconds, weight)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(section_id)
        .bind(title)
        .bind(subsection_kind_str(kind))
        .bind(position)
        .bind(min_time_seconds)
        .bind(weight)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_test(&self, test: &NewTest) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO tests (title, kind, section_id, topic_id, passing_score,
                               required_completion, duration_minutes, max_attempts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&test.title)
        .bind(test_kind_str(test.kind))
        .bind(test.section_id)
        .bind(test.topic_id)
        .bind(test.passing_score)
        .bind(test.required_completion)
        .bind(test.duration_minutes)
        .bind(test.max_attempts.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_question(
        &self,
        test_id: i64,
        question_type: QuestionType,
        correct_answer: &serde_json::Value,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO test_questions (test_id, position, question_type, correct_answer)
            VALUES (?, (SELECT COUNT(*) FROM test_questions WHERE test_id = ?), ?, ?)
            "#,
        )
        .bind(test_id)
        .bind(test_id)
        .bind(question_type.as_str())
        .bind(serde_json::to_string(correct_answer)?)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_content_weight(&self, content_type: ContentType, weight: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO content_weights (content_type, weight) VALUES (?, ?)
            ON CONFLICT(content_type) DO UPDATE SET weight = excluded.weight
            "#,
        )
        .bind(content_type.as_str())
        .bind(weight)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_group(&self, name: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO groups (name) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn add_student(&self, group_id: i64, user_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO group_students (group_id, user_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn grant_topic(&self, group_id: i64, topic_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO group_topics (group_id, topic_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(topic_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Archive or restore a group, topic, section, subsection or test
    pub async fn set_archived(&self, table: ArchivableTable, id: i64, archived: bool) -> Result<()> {
        let sql = format!("UPDATE {} SET is_archived = ? WHERE id = ?", table.as_str());
        let result = sqlx::query(&sql)
            .bind(archived)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("{} {}", table.as_str(), id)));
        }
        Ok(())
    }

    async fn fetch_attempts(&self, sql: &str, binds: &[i64]) -> Result<Vec<TestAttempt>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_attempt).collect()
    }
}

/// Tables that carry an `is_archived` flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivableTable {
    Groups,
    Topics,
    Sections,
    Subsections,
    Tests,
}

impl ArchivableTable {
    fn as_str(self) -> &'static str {
        match self {
            ArchivableTable::Groups => "groups",
            ArchivableTable::Topics => "topics",
            ArchivableTable::Sections => "sections",
            ArchivableTable::Subsections => "subsections",
            ArchivableTable::Tests => "tests",
        }
    }
}

#[async_trait]
impl ProgressStore for SqliteStore {
    async fn topic(&self, id: i64) -> Result<Option<Topic>> {
        let row = sqlx::query("SELECT id, title, is_archived FROM topics WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| -> Result<Topic> {
            Ok(Topic {
                id: r.try_get("id")?,
                title: r.try_get("title")?,
                is_archived: r.try_get("is_archived")?,
            })
        })
        .transpose()
    }

    async fn section(&self, id: i64) -> Result<Option<Section>> {
        let row = sqlx::query(
            "SELECT id, topic_id, title, position, weight, is_archived FROM sections WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_section).transpose()
    }

    async fn subsection(&self, id: i64) -> Result<Option<Subsection>> {
        let sql = format!("SELECT {} FROM subsections WHERE id = ?", SUBSECTION_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_subsection).transpose()
    }

    async fn test(&self, id: i64) -> Result<Option<TestDefinition>> {
        let sql = format!("SELECT {} FROM tests WHERE id = ?", TEST_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_test).transpose()
    }

    async fn sections_for_topic(&self, topic_id: i64) -> Result<Vec<Section>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic_id, title, position, weight, is_archived
            FROM sections
            WHERE topic_id = ? AND is_archived = 0
            ORDER BY position, id
            "#,
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_section).collect()
    }

    async fn subsections_for_topic(&self, topic_id: i64) -> Result<Vec<Subsection>> {
        let rows = sqlx::query(
            r#"
            SELECT ss.id, ss.section_id, ss.title, ss.kind, ss.position,
                   ss.min_time_seconds, ss.weight, ss.is_archived
            FROM subsections ss
            JOIN sections s ON s.id = ss.section_id
            WHERE s.topic_id = ? AND s.is_archived = 0 AND ss.is_archived = 0
            ORDER BY s.position, s.id, ss.position, ss.id
            "#,
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_subsection).collect()
    }

    async fn tests_for_topic(&self, topic_id: i64) -> Result<Vec<TestDefinition>> {
        let sql = format!(
            r#"
            SELECT {cols} FROM tests
            WHERE is_archived = 0
              AND (topic_id = ?
                   OR section_id IN (SELECT id FROM sections WHERE topic_id = ? AND is_archived = 0))
            ORDER BY id
            "#,
            cols = TEST_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(topic_id)
            .bind(topic_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_test).collect()
    }

    async fn answer_key(&self, test_id: i64) -> Result<Vec<AnswerKey>> {
        let rows = sqlx::query(
            r#"
            SELECT id, question_type, correct_answer
            FROM test_questions
            WHERE test_id = ?
            ORDER BY position, id
            "#,
        )
        .bind(test_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<AnswerKey> {
                let question_type: String = r.try_get("question_type")?;
                let correct: String = r.try_get("correct_answer")?;
                Ok(AnswerKey {
                    question_id: r.try_get("id")?,
                    question_type: question_type.parse()?,
                    correct_answer: serde_json::from_str(&correct)?,
                })
            })
            .collect()
    }

    async fn content_weights(&self) -> Result<HashMap<ContentType, f64>> {
        let rows = sqlx::query("SELECT content_type, weight FROM content_weights")
            .fetch_all(&self.pool)
            .await?;

        let mut weights = HashMap::new();
        for row in rows {
            let tag: String = row.try_get("content_type")?;
            let weight: f64 = row.try_get("weight")?;
            match tag.parse::<ContentType>() {
                Ok(content_type) => {
                    weights.insert(content_type, weight);
                }
                Err(_) => warn!("Ignoring weight for unknown content type '{}'", tag),
            }
        }
        Ok(weights)
    }

    async fn student_has_topic_access(&self, user_id: i64, topic_id: i64) -> Result<bool> {
        let has_access: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM group_students gs
                JOIN groups g ON g.id = gs.group_id
                JOIN group_topics gt ON gt.group_id = g.id
                JOIN topics t ON t.id = gt.topic_id
                WHERE gs.user_id = ?
                  AND gt.topic_id = ?
                  AND gs.is_archived = 0
                  AND g.is_archived = 0
                  AND gt.is_archived = 0
                  AND t.is_archived = 0
            )
            "#,
        )
        .bind(user_id)
        .bind(topic_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(has_access)
    }

    async fn subsection_progress(
        &self,
        user_id: i64,
        subsection_id: i64,
    ) -> Result<Option<SubsectionProgress>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, subsection_id, status, time_spent_seconds, flagged_seconds,
                   completion_percentage, last_activity_at, completed_at
            FROM subsection_progress
            WHERE user_id = ? AND subsection_id = ?
            "#,
        )
        .bind(user_id)
        .bind(subsection_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_subsection_progress).transpose()
    }

    async fn subsection_progress_for_topic(
        &self,
        user_id: i64,
        topic_id: i64,
    ) -> Result<Vec<SubsectionProgress>> {
        let rows = sqlx::query(
            r#"
            SELECT sp.user_id, sp.subsection_id, sp.status, sp.time_spent_seconds,
                   sp.flagged_seconds, sp.completion_percentage, sp.last_activity_at,
                   sp.completed_at
            FROM subsection_progress sp
            JOIN subsections ss ON ss.id = sp.subsection_id
            JOIN sections s ON s.id = ss.section_id
            WHERE sp.user_id = ? AND s.topic_id = ?
            "#,
        )
        .bind(user_id)
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_subsection_progress).collect()
    }

    async fn section_progress(
        &self,
        user_id: i64,
        section_id: i64,
    ) -> Result<Option<AggregateProgress>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, section_id AS resource_id, status, completion_percentage, updated_at
            FROM section_progress
            WHERE user_id = ? AND section_id = ?
            "#,
        )
        .bind(user_id)
        .bind(section_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_aggregate).transpose()
    }

    async fn topic_progress(&self, user_id: i64, topic_id: i64) -> Result<Option<AggregateProgress>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, topic_id AS resource_id, status, completion_percentage, updated_at
            FROM topic_progress
            WHERE user_id = ? AND topic_id = ?
            "#,
        )
        .bind(user_id)
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_aggregate).transpose()
    }

    async fn commit_progress(&self, write: &ProgressWrite) -> Result<bool> {
        if write.is_empty() {
            return Ok(true);
        }

        let mut tx = self.pool.begin().await?;

        if let Some(attempt) = &write.attempt {
            let sql = format!(
                r#"
                UPDATE test_attempts
                SET status = ?, expires_at = ?, last_activity_at = ?, auto_extend_count = ?,
                    answers = ?, score = ?, completed_at = ?
                WHERE id = ? AND status IN {}
                "#,
                OPEN_STATUSES
            );
            let result = sqlx::query(&sql)
                .bind(attempt.status.as_str())
                .bind(attempt.expires_at.map(|t| t.to_rfc3339()))
                .bind(attempt.last_activity_at.to_rfc3339())
                .bind(i64::from(attempt.auto_extend_count))
                .bind(serde_json::to_string(&attempt.answers)?)
                .bind(attempt.score)
                .bind(attempt.completed_at.map(|t| t.to_rfc3339()))
                .bind(attempt.id)
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                warn!(
                    attempt_id = attempt.id,
                    "Attempt already finalized in storage, write discarded"
                );
                return Ok(false);
            }
        }

        if let Some(progress) = &write.subsection {
            sqlx::query(
                r#"
                INSERT INTO subsection_progress (
                    user_id, subsection_id, status, time_spent_seconds, flagged_seconds,
                    completion_percentage, last_activity_at, completed_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id, subsection_id) DO UPDATE SET
                    status = excluded.status,
                    time_spent_seconds = excluded.time_spent_seconds,
                    flagged_seconds = excluded.flagged_seconds,
                    completion_percentage = excluded.completion_percentage,
                    last_activity_at = excluded.last_activity_at,
                    completed_at = excluded.completed_at
                "#,
            )
            .bind(progress.user_id)
            .bind(progress.subsection_id)
            .bind(progress.status.as_str())
            .bind(progress.time_spent_seconds)
            .bind(progress.flagged_seconds)
            .bind(progress.completion_percentage)
            .bind(progress.last_activity_at.map(|t| t.to_rfc3339()))
            .bind(progress.completed_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        for section in &write.sections {
            sqlx::query(
                r#"
                INSERT INTO section_progress (user_id, section_id, status, completion_percentage, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(user_id, section_id) DO UPDATE SET
                    status = excluded.status,
                    completion_percentage = excluded.completion_percentage,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(section.user_id)
            .bind(section.resource_id)
            .bind(section.status.as_str())
            .bind(section.completion_percentage)
            .bind(section.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(topic) = &write.topic {
            sqlx::query(
                r#"
                INSERT INTO topic_progress (user_id, topic_id, status, completion_percentage, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(user_id, topic_id) DO UPDATE SET
                    status = excluded.status,
                    completion_percentage = excluded.completion_percentage,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(topic.user_id)
            .bind(topic.resource_id)
            .bind(topic.status.as_str())
            .bind(topic.completion_percentage)
            .bind(topic.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for session in &write.sessions {
            let sql = format!(
                r#"
                INSERT INTO activity_sessions ({})
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(session_id) DO UPDATE SET
                    last_activity_at = excluded.last_activity_at,
                    ended_at = excluded.ended_at,
                    end_reason = excluded.end_reason,
                    accumulated_seconds = excluded.accumulated_seconds,
                    flagged_seconds = excluded.flagged_seconds,
                    heartbeat_count = excluded.heartbeat_count,
                    is_suspicious = excluded.is_suspicious,
                    interval_stddev = excluded.interval_stddev
                WHERE activity_sessions.end_reason IS NULL
                "#,
                SESSION_COLUMNS
            );
            sqlx::query(&sql)
                .bind(session.session_id.to_string())
                .bind(session.user_id)
                .bind(session.subsection_id)
                .bind(session.started_at.to_rfc3339())
                .bind(session.last_activity_at.to_rfc3339())
                .bind(session.ended_at.map(|t| t.to_rfc3339()))
                .bind(session.end_reason.map(|r| r.as_str()))
                .bind(session.accumulated_seconds)
                .bind(session.flagged_seconds)
                .bind(i64::from(session.heartbeat_count))
                .bind(session.is_suspicious)
                .bind(session.interval_stddev)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn activity_sessions(
        &self,
        user_id: i64,
        subsection_id: i64,
        limit: u32,
    ) -> Result<Vec<ActivitySession>> {
        let sql = format!(
            "SELECT {} FROM activity_sessions WHERE user_id = ? AND subsection_id = ? \
             ORDER BY started_at DESC, rowid DESC LIMIT ?",
            SESSION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(subsection_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_activity_session).collect()
    }

    async fn create_attempt(&self, attempt: &NewAttempt) -> Result<TestAttempt> {
        let result = sqlx::query(
            r#"
            INSERT INTO test_attempts (test_id, user_id, status, started_at, expires_at,
                                       last_activity_at, auto_extend_count, answers)
            VALUES (?, ?, 'STARTED', ?, ?, ?, 0, '{}')
            "#,
        )
        .bind(attempt.test_id)
        .bind(attempt.user_id)
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.expires_at.map(|t| t.to_rfc3339()))
        .bind(attempt.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(TestAttempt {
            id: result.last_insert_rowid(),
            test_id: attempt.test_id,
            user_id: attempt.user_id,
            status: AttemptStatus::Started,
            started_at: attempt.started_at,
            expires_at: attempt.expires_at,
            last_activity_at: attempt.started_at,
            auto_extend_count: 0,
            answers: BTreeMap::new(),
            score: None,
            completed_at: None,
        })
    }

    async fn attempt(&self, id: i64) -> Result<Option<TestAttempt>> {
        let sql = format!("SELECT {} FROM test_attempts WHERE id = ?", ATTEMPT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn open_attempt(&self, user_id: i64, test_id: i64) -> Result<Option<TestAttempt>> {
        let sql = format!(
            "SELECT {} FROM test_attempts WHERE user_id = ? AND test_id = ? AND status IN {} \
             ORDER BY id DESC LIMIT 1",
            ATTEMPT_COLUMNS, OPEN_STATUSES
        );
        let mut attempts = self.fetch_attempts(&sql, &[user_id, test_id]).await?;
        Ok(attempts.pop())
    }

    async fn best_scores(&self, user_id: i64, test_ids: &[i64]) -> Result<HashMap<i64, f64>> {
        if test_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; test_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT test_id, MAX(score) AS best
            FROM test_attempts
            WHERE user_id = ? AND status IN {} AND score IS NOT NULL AND test_id IN ({})
            GROUP BY test_id
            "#,
            SCORED_STATUSES, placeholders
        );

        let mut query = sqlx::query(&sql).bind(user_id);
        for test_id in test_ids {
            query = query.bind(*test_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut best = HashMap::new();
        for row in rows {
            best.insert(row.try_get::<i64, _>("test_id")?, row.try_get::<f64, _>("best")?);
        }
        Ok(best)
    }

    async fn scored_attempt_count(&self, user_id: i64, test_id: i64) -> Result<u32> {
        let sql = format!(
            "SELECT COUNT(*) FROM test_attempts WHERE user_id = ? AND test_id = ? AND status IN {}",
            SCORED_STATUSES
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(user_id)
            .bind(test_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn open_attempts_for_user(&self, user_id: i64) -> Result<Vec<TestAttempt>> {
        let sql = format!(
            "SELECT {} FROM test_attempts WHERE user_id = ? AND status IN {} ORDER BY id",
            ATTEMPT_COLUMNS, OPEN_STATUSES
        );
        self.fetch_attempts(&sql, &[user_id]).await
    }

    async fn open_attempts(&self) -> Result<Vec<TestAttempt>> {
        let sql = format!(
            "SELECT {} FROM test_attempts WHERE status IN {} ORDER BY id",
            ATTEMPT_COLUMNS, OPEN_STATUSES
        );
        self.fetch_attempts(&sql, &[]).await
    }
}

fn subsection_kind_str(kind: SubsectionKind) -> &'static str {
    match kind {
        SubsectionKind::Text => "TEXT",
        SubsectionKind::Pdf => "PDF",
        SubsectionKind::Video => "VIDEO",
        SubsectionKind::Presentation => "PRESENTATION",
    }
}

fn test_kind_str(kind: TestKind) -> &'static str {
    match kind {
        TestKind::Hinted => "HINTED",
        TestKind::SectionFinal => "SECTION_FINAL",
        TestKind::GlobalFinal => "GLOBAL_FINAL",
    }
}

fn timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value)
        .ok_or_else(|| Error::Internal(format!("Invalid timestamp in {}: {}", column, value)))
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.try_get(column)?;
    value.map(|v| timestamp(column, &v)).transpose()
}

fn row_to_section(row: &SqliteRow) -> Result<Section> {
    Ok(Section {
        id: row.try_get("id")?,
        topic_id: row.try_get("topic_id")?,
        title: row.try_get("title")?,
        position: row.try_get("position")?,
        weight: row.try_get("weight")?,
        is_archived: row.try_get("is_archived")?,
    })
}

fn row_to_subsection(row: &SqliteRow) -> Result<Subsection> {
    let kind: String = row.try_get("kind")?;
    Ok(Subsection {
        id: row.try_get("id")?,
        section_id: row.try_get("section_id")?,
        title: row.try_get("title")?,
        kind: kind.parse()?,
        position: row.try_get("position")?,
        min_time_seconds: row.try_get("min_time_seconds")?,
        weight: row.try_get("weight")?,
        is_archived: row.try_get("is_archived")?,
    })
}

fn row_to_test(row: &SqliteRow) -> Result<TestDefinition> {
    let kind: String = row.try_get("kind")?;
    let max_attempts: Option<i64> = row.try_get("max_attempts")?;
    Ok(TestDefinition {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        kind: kind.parse()?,
        section_id: row.try_get("section_id")?,
        topic_id: row.try_get("topic_id")?,
        passing_score: row.try_get("passing_score")?,
        required_completion: row.try_get("required_completion")?,
        duration_minutes: row.try_get("duration_minutes")?,
        max_attempts: max_attempts.map(|m| u32::try_from(m.max(0)).unwrap_or(u32::MAX)),
        is_archived: row.try_get("is_archived")?,
    })
}

fn row_to_subsection_progress(row: &SqliteRow) -> Result<SubsectionProgress> {
    let status: String = row.try_get("status")?;
    Ok(SubsectionProgress {
        user_id: row.try_get("user_id")?,
        subsection_id: row.try_get("subsection_id")?,
        status: status.parse::<ProgressStatus>()?,
        time_spent_seconds: row.try_get("time_spent_seconds")?,
        flagged_seconds: row.try_get("flagged_seconds")?,
        completion_percentage: row.try_get("completion_percentage")?,
        last_activity_at: optional_timestamp(row, "last_activity_at")?,
        completed_at: optional_timestamp(row, "completed_at")?,
    })
}

fn row_to_aggregate(row: &SqliteRow) -> Result<AggregateProgress> {
    let status: String = row.try_get("status")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(AggregateProgress {
        user_id: row.try_get("user_id")?,
        resource_id: row.try_get("resource_id")?,
        status: status.parse::<ProgressStatus>()?,
        completion_percentage: row.try_get("completion_percentage")?,
        updated_at: timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_attempt(row: &SqliteRow) -> Result<TestAttempt> {
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let last_activity_at: String = row.try_get("last_activity_at")?;
    let answers: String = row.try_get("answers")?;
    let auto_extend_count: i64 = row.try_get("auto_extend_count")?;

    Ok(TestAttempt {
        id: row.try_get("id")?,
        test_id: row.try_get("test_id")?,
        user_id: row.try_get("user_id")?,
        status: status.parse::<AttemptStatus>()?,
        started_at: timestamp("started_at", &started_at)?,
        expires_at: optional_timestamp(row, "expires_at")?,
        last_activity_at: timestamp("last_activity_at", &last_activity_at)?,
        auto_extend_count: u32::try_from(auto_extend_count.max(0)).unwrap_or(u32::MAX),
        answers: serde_json::from_str(&answers)?,
        score: row.try_get("score")?,
        completed_at: optional_timestamp(row, "completed_at")?,
    })
}

fn row_to_activity_session(row: &SqliteRow) -> Result<ActivitySession> {
    let session_id: String = row.try_get("session_id")?;
    let started_at: String = row.try_get("started_at")?;
    let last_activity_at: String = row.try_get("last_activity_at")?;
    let end_reason: Option<String> = row.try_get("end_reason")?;
    let heartbeat_count: i64 = row.try_get("heartbeat_count")?;

    Ok(ActivitySession {
        session_id: Uuid::parse_str(&session_id)
            .map_err(|e| Error::Internal(format!("Invalid session id {}: {}", session_id, e)))?,
        user_id: row.try_get("user_id")?,
        subsection_id: row.try_get("subsection_id")?,
        started_at: timestamp("started_at", &started_at)?,
        last_activity_at: timestamp("last_activity_at", &last_activity_at)?,
        ended_at: optional_timestamp(row, "ended_at")?,
        end_reason: end_reason.map(|r| r.parse()).transpose()?,
        accumulated_seconds: row.try_get("accumulated_seconds")?,
        flagged_seconds: row.try_get("flagged_seconds")?,
        heartbeat_count: u32::try_from(heartbeat_count.max(0)).unwrap_or(u32::MAX),
        is_suspicious: row.try_get("is_suspicious")?,
        interval_stddev: row.try_get("interval_stddev")?,
    })
}
