//! Test attempt operations and the maintenance sweep

use super::progress::Pending;
use super::Engine;
use crate::access::read;
use crate::attempt::{
    expires_at_for, score_answers, AttemptTransition, ExtensionDecision, NewAttempt, TestAttempt,
};
use crate::error::{ProgressError, ProgressResult};
use crate::models::{ResourceKind, TestDefinition};
use crate::store::ProgressWrite;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use tw_common::events::ProgressEvent;
use tw_common::AttemptStatus;

/// Outcome of one [`Engine::sweep_attempts`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    /// Past their deadline
    pub expired: usize,
    /// Idle longer than the stale limit
    pub stale_expired: usize,
    pub extended: usize,
    /// Attempts whose update failed; retried on the next pass
    pub failed: usize,
}

fn transition_event(attempt: &TestAttempt, transition: &AttemptTransition) -> ProgressEvent {
    ProgressEvent::AttemptStatusChanged {
        attempt_id: attempt.id,
        test_id: attempt.test_id,
        user_id: attempt.user_id,
        old_status: transition.old_status,
        new_status: transition.new_status,
        timestamp: transition.at,
    }
}

impl Engine {
    /// Start (or resume) an attempt at a test.
    ///
    /// An open attempt of the student is returned as is. Otherwise the
    /// test must be available and attempts must remain.
    pub async fn start_attempt(&self, user_id: i64, test_id: i64) -> ProgressResult<TestAttempt> {
        let test = self.require_test(test_id).await?;
        self.require_access(user_id, ResourceKind::Test, test_id).await?;

        self.detached(move |engine| async move { engine.open_attempt(user_id, test).await })
            .await
    }

    async fn require_test(&self, test_id: i64) -> ProgressResult<TestDefinition> {
        let store = self.inner.store.as_ref();
        read(|| store.test(test_id))
            .await?
            .ok_or_else(|| ProgressError::not_found(ResourceKind::Test, test_id))
    }

    async fn open_attempt(&self, user_id: i64, test: TestDefinition) -> ProgressResult<TestAttempt> {
        let inner = &self.inner;
        let store = inner.store.as_ref();
        let _key = inner.test_locks.lock((user_id, test.id)).await;

        if let Some(open) = read(|| store.open_attempt(user_id, test.id)).await? {
            let open = self.refresh_attempt(open.id).await?;
            if open.status.is_open() {
                debug!(user_id, test_id = test.id, attempt_id = open.id, "Resuming open attempt");
                return Ok(open);
            }
        }

        let availability = self.availability_of(user_id, &test).await?;
        if !availability.available {
            return Err(ProgressError::TestUnavailable {
                test_id: test.id,
                reason: availability.reason.unwrap_or_default(),
            });
        }

        if let Some(max) = test.max_attempts {
            let used = read(|| store.scored_attempt_count(user_id, test.id)).await?;
            if used >= max {
                return Err(ProgressError::AttemptsExhausted {
                    test_id: test.id,
                    max,
                });
            }
        }

        let now = inner.clock.now();
        let attempt = store
            .create_attempt(&NewAttempt {
                test_id: test.id,
                user_id,
                started_at: now,
                expires_at: expires_at_for(now, test.duration_minutes, &inner.config.attempts),
            })
            .await?;

        info!(
            user_id,
            test_id = test.id,
            attempt_id = attempt.id,
            expires_at = ?attempt.expires_at,
            "Test attempt started"
        );
        Ok(attempt)
    }

    /// Store one answer. The first answer moves the attempt to IN_PROGRESS.
    pub async fn record_answer(
        &self,
        user_id: i64,
        attempt_id: i64,
        question_id: i64,
        answer: Value,
    ) -> ProgressResult<TestAttempt> {
        self.detached(move |engine| async move {
            let _key = engine.inner.attempt_locks.lock(attempt_id).await;
            let now = engine.inner.clock.now();
            let mut attempt = engine.load_owned(user_id, attempt_id).await?;
            engine.expire_or_fail(&mut attempt, AttemptStatus::InProgress, now).await?;

            let store = engine.inner.store.as_ref();
            let keys = read(|| store.answer_key(attempt.test_id)).await?;
            if !keys.iter().any(|k| k.question_id == question_id) {
                return Err(ProgressError::InvalidInput(format!(
                    "question {} is not part of test {}",
                    question_id, attempt.test_id
                )));
            }

            let transition = attempt.record_answer(question_id, answer, now)?;
            let extension = attempt.consider_extension(now, true, &engine.inner.config.attempts);
            engine.commit_attempt(&attempt).await?;

            if let Some(t) = &transition {
                engine.emit_all(vec![transition_event(&attempt, t)]);
            }
            engine.emit_extension(&attempt, &extension, now);
            Ok(attempt)
        })
        .await
    }

    /// Activity ping from the test page; may push the deadline back
    pub async fn touch_attempt(&self, user_id: i64, attempt_id: i64) -> ProgressResult<TestAttempt> {
        self.detached(move |engine| async move {
            let _key = engine.inner.attempt_locks.lock(attempt_id).await;
            let now = engine.inner.clock.now();
            let mut attempt = engine.load_owned(user_id, attempt_id).await?;
            let current = attempt.status;
            engine.expire_or_fail(&mut attempt, current, now).await?;

            attempt.touch(now)?;
            let extension = attempt.consider_extension(now, true, &engine.inner.config.attempts);
            engine.commit_attempt(&attempt).await?;
            engine.emit_extension(&attempt, &extension, now);
            Ok(attempt)
        })
        .await
    }

    /// Score the attempt against the answer key and close it as COMPLETED
    /// (score ≥ passing score) or FAILED. Section and topic progress are
    /// recomputed in the same transaction.
    pub async fn submit_attempt(&self, user_id: i64, attempt_id: i64) -> ProgressResult<TestAttempt> {
        self.detached(move |engine| async move {
            let inner = &engine.inner;
            let _key = inner.attempt_locks.lock(attempt_id).await;
            let now = inner.clock.now();
            let mut attempt = engine.load_owned(user_id, attempt_id).await?;
            engine.expire_or_fail(&mut attempt, AttemptStatus::Completed, now).await?;

            let test = engine.require_test(attempt.test_id).await?;
            let store = inner.store.as_ref();
            let keys = read(|| store.answer_key(test.id)).await?;
            let score = score_answers(&keys, &attempt.answers);
            let transition = attempt.finish(score, test.passing_score, now)?;

            let topic_id = engine.topic_of_test(&test).await?;
            let _user = inner.user_locks.lock(user_id).await;
            let (sections, topic, derived) = engine
                .derived_changes(
                    user_id,
                    topic_id,
                    Pending {
                        subsection: None,
                        score: Some((test.id, score)),
                    },
                )
                .await?;

            let write = ProgressWrite {
                attempt: Some(attempt.clone()),
                sections,
                topic,
                ..Default::default()
            };
            if !store.commit_progress(&write).await? {
                return Err(engine.terminal_conflict(&attempt).await);
            }

            info!(
                user_id,
                test_id = test.id,
                attempt_id,
                score,
                status = %attempt.status,
                "Test attempt submitted"
            );
            let mut events = vec![transition_event(&attempt, &transition)];
            events.extend(derived);
            engine.emit_all(events);
            Ok(attempt)
        })
        .await
    }

    /// Current state of an attempt; an overdue attempt is expired first
    pub async fn get_attempt(&self, user_id: i64, attempt_id: i64) -> ProgressResult<TestAttempt> {
        let attempt = self.load_owned(user_id, attempt_id).await?;
        if !attempt.is_overdue(self.inner.clock.now()) {
            return Ok(attempt);
        }
        self.detached(move |engine| async move { engine.refresh_attempt(attempt_id).await })
            .await
    }

    /// Expire every overdue open attempt of the student
    pub(crate) async fn expire_overdue_for_user(&self, user_id: i64) -> ProgressResult<usize> {
        let store = self.inner.store.as_ref();
        let now = self.inner.clock.now();
        let overdue: Vec<i64> = read(|| store.open_attempts_for_user(user_id))
            .await?
            .into_iter()
            .filter(|a| a.is_overdue(now))
            .map(|a| a.id)
            .collect();
        if overdue.is_empty() {
            return Ok(0);
        }

        self.detached(move |engine| async move {
            let mut expired = 0;
            for attempt_id in overdue {
                let attempt = engine.refresh_attempt(attempt_id).await?;
                if attempt.status == AttemptStatus::Expired {
                    expired += 1;
                }
            }
            Ok(expired)
        })
        .await
    }

    /// Reload an attempt under its lock and expire it if overdue
    async fn refresh_attempt(&self, attempt_id: i64) -> ProgressResult<TestAttempt> {
        let _key = self.inner.attempt_locks.lock(attempt_id).await;
        let mut attempt = self.load(attempt_id).await?;
        let now = self.inner.clock.now();
        if let Some(transition) = attempt.expire_if_overdue(now) {
            self.commit_attempt(&attempt).await?;
            info!(attempt_id, user_id = attempt.user_id, "Overdue test attempt expired");
            self.emit_all(vec![transition_event(&attempt, &transition)]);
        }
        Ok(attempt)
    }

    async fn load(&self, attempt_id: i64) -> ProgressResult<TestAttempt> {
        let store = self.inner.store.as_ref();
        read(|| store.attempt(attempt_id))
            .await?
            .ok_or_else(|| ProgressError::not_found(ResourceKind::Attempt, attempt_id))
    }

    async fn load_owned(&self, user_id: i64, attempt_id: i64) -> ProgressResult<TestAttempt> {
        let attempt = self.load(attempt_id).await?;
        if attempt.user_id != user_id {
            return Err(ProgressError::AccessDenied {
                kind: ResourceKind::Attempt,
                id: attempt_id,
            });
        }
        Ok(attempt)
    }

    /// Expire an overdue attempt (persisting it) and report the requested
    /// change as invalid; otherwise leave the attempt untouched
    async fn expire_or_fail(
        &self,
        attempt: &mut TestAttempt,
        requested: AttemptStatus,
        now: DateTime<Utc>,
    ) -> ProgressResult<()> {
        if let Some(transition) = attempt.expire_if_overdue(now) {
            self.commit_attempt(attempt).await?;
            self.emit_all(vec![transition_event(attempt, &transition)]);
            return Err(ProgressError::InvalidStateTransition {
                from: AttemptStatus::Expired,
                to: requested,
            });
        }
        Ok(())
    }

    /// Persist an attempt-only update
    async fn commit_attempt(&self, attempt: &TestAttempt) -> ProgressResult<()> {
        let write = ProgressWrite {
            attempt: Some(attempt.clone()),
            ..Default::default()
        };
        if self.inner.store.commit_progress(&write).await? {
            Ok(())
        } else {
            Err(self.terminal_conflict(attempt).await)
        }
    }

    async fn terminal_conflict(&self, attempt: &TestAttempt) -> ProgressError {
        let stored = match self.load(attempt.id).await {
            Ok(stored) => stored.status,
            Err(e) => return e,
        };
        warn!(
            attempt_id = attempt.id,
            stored = %stored,
            requested = %attempt.status,
            "Attempt already terminal in storage"
        );
        ProgressError::InvalidStateTransition {
            from: stored,
            to: attempt.status,
        }
    }

    fn emit_extension(&self, attempt: &TestAttempt, decision: &ExtensionDecision, now: DateTime<Utc>) {
        if let ExtensionDecision::Extended {
            expires_at,
            auto_extend_count,
        } = decision
        {
            info!(
                attempt_id = attempt.id,
                user_id = attempt.user_id,
                auto_extend_count,
                expires_at = %expires_at,
                "Test attempt deadline extended"
            );
            self.inner.events.emit_lossy(ProgressEvent::AttemptExtended {
                attempt_id: attempt.id,
                user_id: attempt.user_id,
                auto_extend_count: *auto_extend_count,
                expires_at: *expires_at,
                timestamp: now,
            });
        }
    }

    /// Student answered recently, or sent a heartbeat on any subsection
    /// within the activity window
    async fn student_active(&self, attempt: &TestAttempt, now: DateTime<Utc>) -> bool {
        let window = Duration::seconds(self.inner.config.attempts.activity_window_seconds as i64);
        if now - attempt.last_activity_at <= window {
            return true;
        }
        match self.inner.sessions.last_user_activity(attempt.user_id).await {
            Ok(Some(last)) => now - last <= window,
            Ok(None) => false,
            Err(e) => {
                warn!(attempt_id = attempt.id, error = %e, "Could not read session activity");
                false
            }
        }
    }

    /// Maintenance pass over every open attempt: expire overdue ones,
    /// expire ones idle past the stale limit, and extend ones close to
    /// their deadline whose student is active
    pub async fn sweep_attempts(&self) -> ProgressResult<SweepReport> {
        self.detached(|engine| async move { engine.sweep().await })
            .await
    }

    async fn sweep(&self) -> ProgressResult<SweepReport> {
        let inner = &self.inner;
        let store = inner.store.as_ref();
        let open = read(|| store.open_attempts()).await?;
        let stale_after = Duration::hours(inner.config.attempts.stale_attempt_hours as i64);
        let mut report = SweepReport {
            examined: open.len(),
            ..Default::default()
        };

        for candidate in open {
            let _key = inner.attempt_locks.lock(candidate.id).await;
            let now = inner.clock.now();
            let mut attempt = match self.load(candidate.id).await {
                Ok(a) if a.status.is_open() => a,
                Ok(_) => continue,
                Err(e) => {
                    warn!(attempt_id = candidate.id, error = %e, "Sweep could not load attempt");
                    report.failed += 1;
                    continue;
                }
            };

            let (transition, extension, stale) = if let Some(t) = attempt.expire_if_overdue(now) {
                (Some(t), ExtensionDecision::NotOpen, false)
            } else if attempt.is_stale(now, stale_after) {
                match attempt.transition_to(AttemptStatus::Expired, now) {
                    Ok(t) => (Some(t), ExtensionDecision::NotOpen, true),
                    Err(e) => {
                        warn!(attempt_id = attempt.id, error = %e, "Sweep could not expire stale attempt");
                        report.failed += 1;
                        continue;
                    }
                }
            } else {
                let active = self.student_active(&attempt, now).await;
                let decision = attempt.consider_extension(now, active, &inner.config.attempts);
                (None, decision, false)
            };

            let extended = matches!(extension, ExtensionDecision::Extended { .. });
            if transition.is_none() && !extended {
                continue;
            }

            if let Err(e) = self.commit_attempt(&attempt).await {
                warn!(attempt_id = attempt.id, error = %e, "Sweep could not update attempt");
                report.failed += 1;
                continue;
            }

            if let Some(t) = &transition {
                if stale {
                    report.stale_expired += 1;
                    info!(attempt_id = attempt.id, user_id = attempt.user_id, "Stale test attempt expired");
                } else {
                    report.expired += 1;
                    info!(attempt_id = attempt.id, user_id = attempt.user_id, "Overdue test attempt expired");
                }
                self.emit_all(vec![transition_event(&attempt, t)]);
            }
            if extended {
                report.extended += 1;
                self.emit_extension(&attempt, &extension, now);
            }
        }

        debug!(?report, "Attempt sweep finished");
        Ok(report)
    }
}
