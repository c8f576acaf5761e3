//! Test attempt state machine and scoring
//!
//! ```text
//! STARTED ──first answer──▶ IN_PROGRESS
//!    │                          │
//!    ├──────────────┬───────────┤
//!    ▼              ▼           ▼
//! COMPLETED       FAILED     EXPIRED
//! ```
//!
//! Terminal states accept no further mutation. EXPIRED is entered when
//! `now > expires_at` before submission; auto-extension pushes
//! `expires_at` back while the student is demonstrably active.

use crate::aggregator::round2;
use crate::config::AttemptConfig;
use crate::error::{ProgressError, ProgressResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tw_common::{AttemptStatus, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionType {
    /// Answer is one option index
    SingleChoice,
    /// Answer is a set of option indices
    MultipleChoice,
    /// Answer is free text compared case-insensitively
    OpenText,
}

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "SINGLE_CHOICE",
            QuestionType::MultipleChoice => "MULTIPLE_CHOICE",
            QuestionType::OpenText => "OPEN_TEXT",
        }
    }
}

impl FromStr for QuestionType {
    type Err = Error;

    fn from_str(s: &str) -> tw_common::Result<Self> {
        match s {
            "SINGLE_CHOICE" => Ok(QuestionType::SingleChoice),
            "MULTIPLE_CHOICE" => Ok(QuestionType::MultipleChoice),
            "OPEN_TEXT" => Ok(QuestionType::OpenText),
            other => Err(Error::InvalidInput(format!("Unknown question type: {}", other))),
        }
    }
}

/// Correct answer for one question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerKey {
    pub question_id: i64,
    pub question_type: QuestionType,
    pub correct_answer: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAttempt {
    pub id: i64,
    pub test_id: i64,
    pub user_id: i64,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    /// None for untimed tests
    pub expires_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub auto_extend_count: u32,
    /// Answers keyed by question id
    pub answers: BTreeMap<i64, Value>,
    pub score: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Values needed to insert a fresh attempt
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub test_id: i64,
    pub user_id: i64,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptTransition {
    pub attempt_id: i64,
    pub old_status: AttemptStatus,
    pub new_status: AttemptStatus,
    pub at: DateTime<Utc>,
}

/// Outcome of an auto-extension check
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionDecision {
    Extended {
        expires_at: DateTime<Utc>,
        auto_extend_count: u32,
    },
    /// Deadline not close enough yet, or the attempt is untimed
    NotNeeded,
    /// No recent activity from the student
    Inactive,
    LimitReached,
    /// Attempt is terminal or already past its deadline
    NotOpen,
}

/// Allowed edges of the attempt DAG
pub fn can_transition(from: AttemptStatus, to: AttemptStatus) -> bool {
    use AttemptStatus::*;
    matches!(
        (from, to),
        (Started, InProgress)
            | (Started, Completed)
            | (Started, Failed)
            | (Started, Expired)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Expired)
    )
}

/// Deadline for an attempt started at `started_at`
pub fn expires_at_for(
    started_at: DateTime<Utc>,
    duration_minutes: Option<i64>,
    cfg: &AttemptConfig,
) -> Option<DateTime<Utc>> {
    duration_minutes.filter(|m| *m > 0).map(|minutes| {
        started_at
            + Duration::minutes(minutes)
            + Duration::seconds(cfg.expiry_grace_seconds as i64)
    })
}

impl TestAttempt {
    pub fn transition_to(
        &mut self,
        to: AttemptStatus,
        now: DateTime<Utc>,
    ) -> ProgressResult<AttemptTransition> {
        if !can_transition(self.status, to) {
            return Err(ProgressError::InvalidStateTransition {
                from: self.status,
                to,
            });
        }

        let transition = AttemptTransition {
            attempt_id: self.id,
            old_status: self.status,
            new_status: to,
            at: now,
        };
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(transition)
    }

    /// Open and strictly past its deadline
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.expires_at.is_some_and(|deadline| now > deadline)
    }

    /// Open and idle longer than `max_idle`
    pub fn is_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        self.status.is_open() && now - self.last_activity_at > max_idle
    }

    /// Move to EXPIRED if the deadline has passed
    pub fn expire_if_overdue(&mut self, now: DateTime<Utc>) -> Option<AttemptTransition> {
        if self.is_overdue(now) {
            self.transition_to(AttemptStatus::Expired, now).ok()
        } else {
            None
        }
    }

    /// Store an answer; the first answer moves STARTED to IN_PROGRESS
    pub fn record_answer(
        &mut self,
        question_id: i64,
        answer: Value,
        now: DateTime<Utc>,
    ) -> ProgressResult<Option<AttemptTransition>> {
        let transition = match self.status {
            AttemptStatus::Started => Some(self.transition_to(AttemptStatus::InProgress, now)?),
            AttemptStatus::InProgress => None,
            terminal => {
                return Err(ProgressError::InvalidStateTransition {
                    from: terminal,
                    to: AttemptStatus::InProgress,
                })
            }
        };

        self.answers.insert(question_id, answer);
        self.last_activity_at = now;
        Ok(transition)
    }

    /// Record that the student is still working on the attempt
    pub fn touch(&mut self, now: DateTime<Utc>) -> ProgressResult<()> {
        if self.status.is_terminal() {
            return Err(ProgressError::InvalidStateTransition {
                from: self.status,
                to: self.status,
            });
        }
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
        Ok(())
    }

    /// Push the deadline back if it is close, the student is active and
    /// extensions remain
    pub fn consider_extension(
        &mut self,
        now: DateTime<Utc>,
        student_active: bool,
        cfg: &AttemptConfig,
    ) -> ExtensionDecision {
        let Some(deadline) = self.expires_at else {
            return ExtensionDecision::NotNeeded;
        };
        if self.status.is_terminal() || now > deadline {
            return ExtensionDecision::NotOpen;
        }
        if deadline - now > Duration::minutes(cfg.extension_warning_minutes as i64) {
            return ExtensionDecision::NotNeeded;
        }
        if self.auto_extend_count >= cfg.max_auto_extensions {
            return ExtensionDecision::LimitReached;
        }
        if !student_active {
            return ExtensionDecision::Inactive;
        }

        let extended = deadline + Duration::minutes(cfg.auto_extension_minutes as i64);
        self.expires_at = Some(extended);
        self.auto_extend_count += 1;
        ExtensionDecision::Extended {
            expires_at: extended,
            auto_extend_count: self.auto_extend_count,
        }
    }

    /// Score and close the attempt: COMPLETED at or above `passing_score`,
    /// FAILED below it
    pub fn finish(
        &mut self,
        score: f64,
        passing_score: f64,
        now: DateTime<Utc>,
    ) -> ProgressResult<AttemptTransition> {
        let target = if score >= passing_score {
            AttemptStatus::Completed
        } else {
            AttemptStatus::Failed
        };
        let transition = self.transition_to(target, now)?;
        self.score = Some(score);
        self.last_activity_at = now;
        Ok(transition)
    }
}

/// Percentage (0-100, two decimals) of questions answered correctly
pub fn score_answers(keys: &[AnswerKey], answers: &BTreeMap<i64, Value>) -> f64 {
    if keys.is_empty() {
        return 0.0;
    }

    let correct = keys
        .iter()
        .filter(|key| {
            answers
                .get(&key.question_id)
                .is_some_and(|answer| is_correct(key, answer))
        })
        .count();

    round2(correct as f64 / keys.len() as f64 * 100.0)
}

fn is_correct(key: &AnswerKey, answer: &Value) -> bool {
    match key.question_type {
        QuestionType::SingleChoice => match (answer.as_i64(), key.correct_answer.as_i64()) {
            (Some(given), Some(expected)) => given == expected,
            _ => false,
        },
        QuestionType::MultipleChoice => match (index_set(answer), index_set(&key.correct_answer)) {
            (Some(given), Some(expected)) => given == expected,
            _ => false,
        },
        QuestionType::OpenText => {
            let Some(given) = answer.as_str().map(normalize_text) else {
                return false;
            };
            // Either one accepted answer or a list of them
            match &key.correct_answer {
                Value::String(expected) => normalize_text(expected) == given,
                Value::Array(options) => options
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|expected| normalize_text(expected) == given),
                _ => false,
            }
        }
    }
}

fn index_set(value: &Value) -> Option<BTreeSet<i64>> {
    value
        .as_array()?
        .iter()
        .map(Value::as_i64)
        .collect::<Option<BTreeSet<i64>>>()
}

fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn attempt(expires_in_minutes: Option<i64>) -> TestAttempt {
        TestAttempt {
            id: 1,
            test_id: 10,
            user_id: 100,
            status: AttemptStatus::Started,
            started_at: t0(),
            expires_at: expires_in_minutes.map(|m| t0() + Duration::minutes(m)),
            last_activity_at: t0(),
            auto_extend_count: 0,
            answers: BTreeMap::new(),
            score: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_first_answer_moves_to_in_progress() {
        let mut a = attempt(Some(20));
        let transition = a.record_answer(1, json!(2), t0() + Duration::seconds(30)).unwrap();
        assert_eq!(
            transition.map(|t| (t.old_status, t.new_status)),
            Some((AttemptStatus::Started, AttemptStatus::InProgress))
        );

        // Second answer is not a transition
        assert_eq!(a.record_answer(2, json!(0), t0() + Duration::seconds(40)).unwrap(), None);
        assert_eq!(a.answers.len(), 2);
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in [AttemptStatus::Completed, AttemptStatus::Failed, AttemptStatus::Expired] {
            let mut a = attempt(Some(20));
            a.status = terminal;
            let before = a.clone();

            assert!(a.record_answer(1, json!(1), t0()).is_err());
            assert!(a.touch(t0()).is_err());
            assert!(a.finish(100.0, 60.0, t0()).is_err());
            for target in [
                AttemptStatus::Started,
                AttemptStatus::InProgress,
                AttemptStatus::Completed,
                AttemptStatus::Failed,
                AttemptStatus::Expired,
            ] {
                assert!(a.transition_to(target, t0()).is_err());
            }
            assert_eq!(a.expire_if_overdue(t0() + Duration::hours(5)), None);
            assert_eq!(a, before, "terminal attempt was mutated");
        }
    }

    #[test]
    fn test_expires_only_strictly_after_deadline() {
        let mut a = attempt(Some(20));
        let deadline = a.expires_at.unwrap();

        assert_eq!(a.expire_if_overdue(deadline), None);
        let transition = a.expire_if_overdue(deadline + Duration::seconds(1)).unwrap();
        assert_eq!(transition.new_status, AttemptStatus::Expired);
        assert!(a.completed_at.is_some());
    }

    #[test]
    fn test_untimed_attempt_never_overdue() {
        let a = attempt(None);
        assert!(!a.is_overdue(t0() + Duration::days(30)));
        assert!(a.is_stale(t0() + Duration::days(2), Duration::hours(24)));
    }

    #[test]
    fn test_finish_scores_against_passing_score() {
        let mut a = attempt(Some(20));
        let t = a.finish(75.0, 60.0, t0()).unwrap();
        assert_eq!(t.new_status, AttemptStatus::Completed);
        assert_eq!(a.score, Some(75.0));

        let mut b = attempt(Some(20));
        let t = b.finish(59.99, 60.0, t0()).unwrap();
        assert_eq!(t.new_status, AttemptStatus::Failed);
    }

    #[test]
    fn test_extension_requires_activity_and_proximity() {
        let cfg = AttemptConfig::default();
        let mut a = attempt(Some(20));
        let deadline = a.expires_at.unwrap();

        // Far from the deadline
        assert_eq!(
            a.consider_extension(deadline - Duration::minutes(10), true, &cfg),
            ExtensionDecision::NotNeeded
        );
        // Close but idle
        assert_eq!(
            a.consider_extension(deadline - Duration::minutes(1), false, &cfg),
            ExtensionDecision::Inactive
        );
        // Close and active
        let decision = a.consider_extension(deadline - Duration::minutes(1), true, &cfg);
        assert_eq!(
            decision,
            ExtensionDecision::Extended {
                expires_at: deadline + Duration::minutes(5),
                auto_extend_count: 1,
            }
        );
    }

    #[test]
    fn test_extension_limit() {
        let cfg = AttemptConfig::default();
        let mut a = attempt(Some(1));

        for expected in 1..=3 {
            let deadline = a.expires_at.unwrap();
            let decision = a.consider_extension(deadline - Duration::seconds(30), true, &cfg);
            assert!(matches!(
                decision,
                ExtensionDecision::Extended { auto_extend_count, .. } if auto_extend_count == expected
            ));
        }

        let deadline = a.expires_at.unwrap();
        assert_eq!(
            a.consider_extension(deadline - Duration::seconds(30), true, &cfg),
            ExtensionDecision::LimitReached
        );
        assert_eq!(a.auto_extend_count, 3);
    }

    #[test]
    fn test_expiry_includes_grace() {
        let cfg = AttemptConfig::default();
        assert_eq!(
            expires_at_for(t0(), Some(20), &cfg),
            Some(t0() + Duration::minutes(20) + Duration::seconds(30))
        );
        assert_eq!(expires_at_for(t0(), None, &cfg), None);
        assert_eq!(expires_at_for(t0(), Some(0), &cfg), None);
    }

    #[test]
    fn test_scoring_by_question_type() {
        let keys = vec![
            AnswerKey {
                question_id: 1,
                question_type: QuestionType::SingleChoice,
                correct_answer: json!(2),
            },
            AnswerKey {
                question_id: 2,
                question_type: QuestionType::MultipleChoice,
                correct_answer: json!([0, 3]),
            },
            AnswerKey {
                question_id: 3,
                question_type: QuestionType::OpenText,
                correct_answer: json!("Ownership"),
            },
        ];

        let mut answers = BTreeMap::new();
        answers.insert(1, json!(2));
        answers.insert(2, json!([3, 0]));
        answers.insert(3, json!("  ownership "));
        assert_eq!(score_answers(&keys, &answers), 100.0);

        answers.insert(2, json!([0]));
        assert_eq!(score_answers(&keys, &answers), 66.67);

        answers.remove(&3);
        assert_eq!(score_answers(&keys, &answers), 33.33);

        assert_eq!(score_answers(&[], &answers), 0.0);
    }
}
