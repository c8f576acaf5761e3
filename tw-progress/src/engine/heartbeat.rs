//! Heartbeat ingestion and viewing sessions

use super::progress::Pending;
use super::Engine;
use crate::access::read;
use crate::aggregator::{apply_time_credit, round2};
use crate::error::{ProgressError, ProgressResult};
use crate::heartbeat::{HeartbeatVerdict, RateDecision, VerdictReason};
use crate::models::{ActivitySession, ResourceKind, SessionEndReason, Subsection, SubsectionProgress};
use crate::session::{SessionLookup, SessionState, SessionStatus};
use crate::store::ProgressWrite;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tw_common::events::ProgressEvent;
use tw_common::ProgressStatus;
use uuid::Uuid;

/// Sessions listed by [`Engine::subsection_status`]
const RECENT_SESSIONS: u32 = 5;

/// `RecordHeartbeat` result: `{accepted, time_credited_seconds,
/// session_status}` plus the subsection's state after the heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReceipt {
    pub accepted: bool,
    pub time_credited_seconds: f64,
    pub session_status: SessionStatus,
    pub reason: VerdictReason,
    pub is_suspicious: bool,
    pub session_id: Option<Uuid>,
    pub time_spent_seconds: f64,
    pub completion_percentage: f64,
    pub subsection_status: ProgressStatus,
    /// Cadence the client should keep
    pub next_heartbeat_in_seconds: f64,
}

impl HeartbeatReceipt {
    fn rejected(
        verdict: &HeartbeatVerdict,
        session_id: Option<Uuid>,
        stored: Option<&SubsectionProgress>,
        next_heartbeat_in_seconds: f64,
    ) -> Self {
        Self {
            accepted: false,
            time_credited_seconds: 0.0,
            session_status: SessionStatus::Unchanged,
            reason: verdict.reason,
            is_suspicious: verdict.is_suspicious,
            session_id,
            time_spent_seconds: stored.map(|s| s.time_spent_seconds).unwrap_or(0.0),
            completion_percentage: round2(stored.map(|s| s.completion_percentage).unwrap_or(0.0)),
            subsection_status: stored.map(|s| s.status).unwrap_or(ProgressStatus::Started),
            next_heartbeat_in_seconds,
        }
    }
}

/// Tracked state of one subsection for one student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsectionStatusView {
    pub subsection_id: i64,
    /// A progress row exists (the student has opened the subsection)
    pub exists: bool,
    pub status: ProgressStatus,
    pub time_spent_seconds: f64,
    pub completion_percentage: f64,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub session_active: bool,
    pub is_suspicious: bool,
    /// Newest first, including the live session
    pub recent_sessions: Vec<ActivitySession>,
}

impl Engine {
    /// `RecordHeartbeat(user, subsection, client_timestamp)`
    ///
    /// Rate-limited requests fail with `RateLimited` and change nothing.
    /// Heartbeats that arrive too soon, or replay an already applied client
    /// timestamp, come back with `accepted = false` and still take a
    /// rate-limit slot. An accepted heartbeat that would open a session
    /// beyond the parallel limit fails with `SessionCapacityExceeded` and
    /// takes no slot.
    pub async fn record_heartbeat(
        &self,
        user_id: i64,
        subsection_id: i64,
        client_timestamp: DateTime<Utc>,
    ) -> ProgressResult<HeartbeatReceipt> {
        let subsection = self.require_subsection(subsection_id).await?;
        self.require_access(user_id, ResourceKind::Subsection, subsection_id)
            .await?;

        self.detached(move |engine| async move {
            engine
                .apply_heartbeat(user_id, subsection, client_timestamp)
                .await
        })
        .await
    }

    async fn require_subsection(&self, subsection_id: i64) -> ProgressResult<Subsection> {
        let store = self.inner.store.as_ref();
        read(|| store.subsection(subsection_id))
            .await?
            .ok_or_else(|| ProgressError::not_found(ResourceKind::Subsection, subsection_id))
    }

    async fn topic_of_section(&self, section_id: i64) -> ProgressResult<i64> {
        let store = self.inner.store.as_ref();
        read(|| store.section(section_id))
            .await?
            .map(|s| s.topic_id)
            .ok_or_else(|| ProgressError::not_found(ResourceKind::Section, section_id))
    }

    async fn apply_heartbeat(
        &self,
        user_id: i64,
        subsection: Subsection,
        client_timestamp: DateTime<Utc>,
    ) -> ProgressResult<HeartbeatReceipt> {
        let inner = &self.inner;
        let store = inner.store.as_ref();
        let subsection_id = subsection.id;

        let _key = inner.subsection_locks.lock((user_id, subsection_id)).await;
        let now = inner.clock.now();

        let next_heartbeat = inner.config.tracking.heartbeat_interval_seconds;

        if let RateDecision::Limited {
            retry_after_seconds,
        } = inner.rate_limiter.check(user_id, subsection_id, now).await?
        {
            return Err(ProgressError::RateLimited {
                retry_after_seconds,
            });
        }

        let lookup = inner.sessions.load(user_id, subsection_id, now).await?;
        let verdict = inner
            .validator
            .validate(lookup.live(), now, client_timestamp);
        if !verdict.accepted {
            debug!(user_id, subsection_id, reason = ?verdict.reason, "Heartbeat not accepted");
            inner.rate_limiter.record(user_id, subsection_id, now).await?;
            let stored = read(|| store.subsection_progress(user_id, subsection_id)).await?;
            return Ok(HeartbeatReceipt::rejected(
                &verdict,
                lookup.live().map(|s| s.session_id),
                stored.as_ref(),
                next_heartbeat,
            ));
        }

        let _user = inner.user_locks.lock(user_id).await;

        let mut opened_with = None;
        if lookup.opens_session() {
            let open = inner
                .sessions
                .open_session_count(user_id, subsection_id, now)
                .await?;
            let max = inner.config.tracking.max_parallel_sessions;
            if open >= max {
                warn!(user_id, subsection_id, open, max, "Parallel session limit reached");
                return Err(ProgressError::SessionCapacityExceeded { open, max });
            }
            opened_with = Some(open);
        }
        inner.rate_limiter.record(user_id, subsection_id, now).await?;

        let restore_to = lookup.live().cloned();
        let timed_out = match &lookup {
            SessionLookup::TimedOut(state) => Some(state.clone()),
            _ => None,
        };
        let mut advance = inner.sessions.advance(
            lookup,
            &verdict,
            &inner.validator,
            user_id,
            subsection_id,
            now,
            client_timestamp,
        );
        if let Some(open) = opened_with {
            advance.state.parallel_session_count = open + 1;
        }

        let mut events = Vec::new();
        let mut finished = Vec::new();
        match advance.status {
            SessionStatus::Started => {
                if let Some(old) = &timed_out {
                    finished.push(old.ended(now, SessionEndReason::TimedOut));
                    events.push(session_closed(old, now));
                }
                debug!(user_id, subsection_id, session_id = %advance.state.session_id, "Session started");
                events.push(ProgressEvent::SessionStarted {
                    user_id,
                    subsection_id,
                    session_id: advance.state.session_id,
                    timestamp: now,
                });
            }
            SessionStatus::RolledOver => {
                if let Some(previous) = &advance.previous {
                    finished.push(previous.ended(now, SessionEndReason::RolledOver));
                    info!(
                        user_id,
                        subsection_id,
                        accumulated_seconds = previous.accumulated_seconds,
                        "Session reached maximum duration, rolled over"
                    );
                    events.push(ProgressEvent::SessionRolledOver {
                        user_id,
                        subsection_id,
                        previous_session_id: previous.session_id,
                        session_id: advance.state.session_id,
                        previous_accumulated_seconds: previous.accumulated_seconds,
                        timestamp: now,
                    });
                }
            }
            SessionStatus::Continued | SessionStatus::Unchanged => {}
        }

        let stored = read(|| store.subsection_progress(user_id, subsection_id)).await?;
        let tracking = &inner.config.tracking;
        let row = apply_time_credit(
            stored.as_ref(),
            user_id,
            subsection_id,
            advance.credited_seconds,
            advance.flagged_seconds,
            tracking.required_seconds(subsection.min_time_seconds),
            tracking.suspicious_policy,
            now,
        );

        finished.push(advance.state.activity());
        let mut write = ProgressWrite {
            subsection: Some(row.clone()),
            sessions: finished,
            ..Default::default()
        };
        if stored.as_ref().map(|s| s.status) != Some(row.status) {
            let topic_id = self.topic_of_section(subsection.section_id).await?;
            let (sections, topic, derived) = self
                .derived_changes(
                    user_id,
                    topic_id,
                    Pending {
                        subsection: Some(&row),
                        score: None,
                    },
                )
                .await?;
            write.sections = sections;
            write.topic = topic;
            if row.status == ProgressStatus::Completed {
                events.push(ProgressEvent::SubsectionCompleted {
                    user_id,
                    subsection_id,
                    time_spent_seconds: row.time_spent_seconds,
                    timestamp: now,
                });
            }
            events.extend(derived);
        }

        // Session first: if the store write then fails, the session is put
        // back and the heartbeat counts as not credited
        inner.sessions.save(&advance.state, now).await?;
        if let Err(e) = store.commit_progress(&write).await {
            error!(user_id, subsection_id, error = %e, "Failed to persist heartbeat credit");
            self.restore_session(user_id, subsection_id, restore_to, now)
                .await;
            return Err(e.into());
        }

        if advance.newly_suspicious {
            let stddev = advance.state.interval_stddev.unwrap_or(0.0);
            warn!(
                user_id,
                subsection_id,
                interval_stddev = stddev,
                heartbeats = advance.state.heartbeat_count,
                "Machine-regular heartbeat cadence, session flagged"
            );
            events.push(ProgressEvent::SuspiciousActivity {
                user_id,
                subsection_id,
                session_id: advance.state.session_id,
                interval_stddev: stddev,
                timestamp: now,
            });
        }

        self.emit_all(events);

        Ok(HeartbeatReceipt {
            accepted: true,
            time_credited_seconds: advance.credited_seconds,
            session_status: advance.status,
            reason: verdict.reason,
            is_suspicious: advance.state.is_suspicious,
            session_id: Some(advance.state.session_id),
            time_spent_seconds: row.time_spent_seconds,
            completion_percentage: round2(row.completion_percentage),
            subsection_status: row.status,
            next_heartbeat_in_seconds: next_heartbeat,
        })
    }

    async fn restore_session(
        &self,
        user_id: i64,
        subsection_id: i64,
        previous: Option<SessionState>,
        now: DateTime<Utc>,
    ) {
        let sessions = &self.inner.sessions;
        let result = match previous {
            Some(state) => sessions.save(&state, now).await,
            None => sessions.close(user_id, subsection_id).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(user_id, subsection_id, error = %e, "Failed to restore session after write failure");
        }
    }

    /// End the viewing session explicitly (page closed). Closing when no
    /// session is open is not an error.
    pub async fn close_session(
        &self,
        user_id: i64,
        subsection_id: i64,
    ) -> ProgressResult<SubsectionStatusView> {
        self.require_subsection(subsection_id).await?;

        self.detached(move |engine| async move {
            {
                let inner = &engine.inner;
                let _key = inner.subsection_locks.lock((user_id, subsection_id)).await;
                let _user = inner.user_locks.lock(user_id).await;
                let now = inner.clock.now();

                let ended = match inner.sessions.load(user_id, subsection_id, now).await? {
                    SessionLookup::Live(state) => Some((state, SessionEndReason::Closed)),
                    SessionLookup::TimedOut(state) => Some((state, SessionEndReason::TimedOut)),
                    SessionLookup::Idle => None,
                };

                if let Some((state, reason)) = ended {
                    // Audit row first: a failed write leaves the session open
                    let write = ProgressWrite {
                        sessions: vec![state.ended(now, reason)],
                        ..Default::default()
                    };
                    inner.store.commit_progress(&write).await?;
                    inner.sessions.close(user_id, subsection_id).await?;
                    info!(
                        user_id,
                        subsection_id,
                        accumulated_seconds = state.accumulated_seconds,
                        ?reason,
                        "Session closed"
                    );
                    inner.events.emit_lossy(session_closed(&state, now));
                }
            }
            engine.subsection_status(user_id, subsection_id).await
        })
        .await
    }

    /// Persisted progress of one subsection, whether a session is live, and
    /// the most recent session audit rows
    pub async fn subsection_status(
        &self,
        user_id: i64,
        subsection_id: i64,
    ) -> ProgressResult<SubsectionStatusView> {
        self.require_subsection(subsection_id).await?;

        let inner = &self.inner;
        let store = inner.store.as_ref();
        let stored = read(|| store.subsection_progress(user_id, subsection_id)).await?;
        let lookup = inner
            .sessions
            .load(user_id, subsection_id, inner.clock.now())
            .await?;
        let live = lookup.live();
        let recent_sessions =
            read(|| store.activity_sessions(user_id, subsection_id, RECENT_SESSIONS)).await?;

        Ok(SubsectionStatusView {
            subsection_id,
            exists: stored.is_some(),
            status: stored.as_ref().map(|s| s.status).unwrap_or(ProgressStatus::Started),
            time_spent_seconds: stored.as_ref().map(|s| s.time_spent_seconds).unwrap_or(0.0),
            completion_percentage: round2(
                stored.as_ref().map(|s| s.completion_percentage).unwrap_or(0.0),
            ),
            completed_at: stored.as_ref().and_then(|s| s.completed_at),
            last_activity_at: stored.as_ref().and_then(|s| s.last_activity_at),
            session_active: live.is_some(),
            is_suspicious: live.is_some_and(|s| s.is_suspicious),
            recent_sessions,
        })
    }
}

fn session_closed(state: &SessionState, now: DateTime<Utc>) -> ProgressEvent {
    ProgressEvent::SessionClosed {
        user_id: state.user_id,
        subsection_id: state.subsection_id,
        session_id: state.session_id,
        accumulated_seconds: state.accumulated_seconds,
        timestamp: now,
    }
}
