//! Session tracking per (user, subsection)
//!
//! ```text
//! Idle ──first accepted heartbeat──▶ Active ──accepted heartbeat──▶ Active
//!  ▲                                  │  │
//!  └──── silence > session timeout ───┘  └── active > max duration ──▶ new Active
//! ```
//!
//! Session state lives in the cache for twice the session timeout, so a
//! student returning after a timeout still finds the old session and it can
//! be closed out. A per-user index records the last activity of every open
//! session so parallel sessions can be counted.

use crate::cache::{CacheClient, CacheError};
use crate::config::TrackingConfig;
use crate::error::ProgressResult;
use crate::heartbeat::{HeartbeatValidator, HeartbeatVerdict};
use crate::models::{ActivitySession, SessionEndReason};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use tw_common::retry::retry_once;
use uuid::Uuid;

/// `{started_at, last_activity_at, accumulated_seconds, parallel_session_count}`
/// plus the bookkeeping needed for deduplication and bot detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Uuid,
    pub user_id: i64,
    pub subsection_id: i64,
    pub started_at: DateTime<Utc>,
    /// Server time of the last accepted heartbeat
    pub last_activity_at: DateTime<Utc>,
    /// Client timestamp of the last accepted heartbeat (dedup high-water mark)
    pub last_client_at: DateTime<Utc>,
    pub accumulated_seconds: f64,
    /// Part of `accumulated_seconds` credited while flagged
    pub flagged_seconds: f64,
    pub heartbeat_count: u32,
    /// Most recent server-measured intervals, oldest first
    pub recent_intervals: Vec<f64>,
    pub is_suspicious: bool,
    pub interval_stddev: Option<f64>,
    pub parallel_session_count: u32,
}

impl SessionState {
    /// Audit row of the session as it stands
    pub fn activity(&self) -> ActivitySession {
        ActivitySession {
            session_id: self.session_id,
            user_id: self.user_id,
            subsection_id: self.subsection_id,
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            ended_at: None,
            end_reason: None,
            accumulated_seconds: self.accumulated_seconds,
            flagged_seconds: self.flagged_seconds,
            heartbeat_count: self.heartbeat_count,
            is_suspicious: self.is_suspicious,
            interval_stddev: self.interval_stddev,
        }
    }

    /// Final audit row. A timed-out session ends at its last heartbeat.
    pub fn ended(&self, now: DateTime<Utc>, reason: SessionEndReason) -> ActivitySession {
        let ended_at = match reason {
            SessionEndReason::TimedOut => self.last_activity_at,
            SessionEndReason::Closed | SessionEndReason::RolledOver => now,
        };
        ActivitySession {
            ended_at: Some(ended_at),
            end_reason: Some(reason),
            ..self.activity()
        }
    }
}

/// What the stored state means for the next heartbeat
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLookup {
    /// No session on record
    Idle,
    Live(SessionState),
    /// Session exists but has been silent past the timeout
    TimedOut(SessionState),
}

impl SessionLookup {
    pub fn live(&self) -> Option<&SessionState> {
        match self {
            SessionLookup::Live(state) => Some(state),
            _ => None,
        }
    }

    /// An accepted heartbeat will open a new session
    pub fn opens_session(&self) -> bool {
        !matches!(self, SessionLookup::Live(_))
    }
}

/// Session-level result of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Started,
    Continued,
    /// Previous session hit the maximum duration; a new one replaced it
    RolledOver,
    /// Heartbeat rejected, session untouched
    Unchanged,
}

/// State after applying an accepted heartbeat
#[derive(Debug, Clone)]
pub struct SessionAdvance {
    pub state: SessionState,
    pub status: SessionStatus,
    pub credited_seconds: f64,
    /// Portion of `credited_seconds` credited under suspicion
    pub flagged_seconds: f64,
    /// Session closed by a rollover
    pub previous: Option<SessionState>,
    pub newly_suspicious: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    session_id: Uuid,
    last_activity_at: DateTime<Utc>,
}

pub struct SessionTracker {
    cache: Arc<dyn CacheClient>,
    config: TrackingConfig,
}

impl SessionTracker {
    pub fn new(cache: Arc<dyn CacheClient>, config: TrackingConfig) -> Self {
        Self { cache, config }
    }

    fn state_key(user_id: i64, subsection_id: i64) -> String {
        format!("session:{}:{}", user_id, subsection_id)
    }

    fn index_key(user_id: i64) -> String {
        format!("session:index:{}", user_id)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> ProgressResult<Option<T>> {
        let value = retry_once("session read", || self.cache.get(key)).await?;
        match value {
            Some(v) => match serde_json::from_value(v) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => {
                    // A corrupt entry only costs the current session
                    warn!(key, error = %e, "Discarding malformed session entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn read_index(&self, user_id: i64) -> ProgressResult<HashMap<i64, IndexEntry>> {
        Ok(self
            .read::<HashMap<i64, IndexEntry>>(&Self::index_key(user_id))
            .await?
            .unwrap_or_default())
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> ProgressResult<()> {
        let json = serde_json::to_value(value).map_err(|e| CacheError::Malformed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.cache.set(key, json, self.retention()).await?;
        Ok(())
    }

    fn retention(&self) -> chrono::Duration {
        self.config.session_timeout() * 2
    }

    /// Classify the stored session for (user, subsection) at `now`
    pub async fn load(
        &self,
        user_id: i64,
        subsection_id: i64,
        now: DateTime<Utc>,
    ) -> ProgressResult<SessionLookup> {
        let state = self
            .read::<SessionState>(&Self::state_key(user_id, subsection_id))
            .await?;

        Ok(match state {
            None => SessionLookup::Idle,
            Some(state) if now - state.last_activity_at > self.config.session_timeout() => {
                SessionLookup::TimedOut(state)
            }
            Some(state) => SessionLookup::Live(state),
        })
    }

    /// Open sessions of the user on subsections other than `excluding`
    pub async fn open_session_count(
        &self,
        user_id: i64,
        excluding_subsection: i64,
        now: DateTime<Utc>,
    ) -> ProgressResult<u32> {
        let window = self.config.parallel_session_window();
        let index = self.read_index(user_id).await?;
        let open = index
            .iter()
            .filter(|(subsection_id, entry)| {
                **subsection_id != excluding_subsection && now - entry.last_activity_at <= window
            })
            .count();
        Ok(open as u32)
    }

    /// Most recent heartbeat of the user on any subsection
    pub async fn last_user_activity(&self, user_id: i64) -> ProgressResult<Option<DateTime<Utc>>> {
        let index = self.read_index(user_id).await?;
        Ok(index.values().map(|entry| entry.last_activity_at).max())
    }

    /// Apply an accepted heartbeat to the looked-up session (pure)
    #[allow(clippy::too_many_arguments)]
    pub fn advance(
        &self,
        lookup: SessionLookup,
        verdict: &HeartbeatVerdict,
        validator: &HeartbeatValidator,
        user_id: i64,
        subsection_id: i64,
        now: DateTime<Utc>,
        client_timestamp: DateTime<Utc>,
    ) -> SessionAdvance {
        let fresh = |accumulated: f64| SessionState {
            session_id: Uuid::new_v4(),
            user_id,
            subsection_id,
            started_at: now,
            last_activity_at: now,
            last_client_at: client_timestamp,
            accumulated_seconds: accumulated,
            flagged_seconds: 0.0,
            heartbeat_count: 1,
            recent_intervals: Vec::new(),
            is_suspicious: false,
            interval_stddev: None,
            parallel_session_count: 1,
        };

        let mut state = match lookup {
            SessionLookup::Idle | SessionLookup::TimedOut(_) => {
                return SessionAdvance {
                    state: fresh(0.0),
                    status: SessionStatus::Started,
                    credited_seconds: 0.0,
                    flagged_seconds: 0.0,
                    previous: None,
                    newly_suspicious: false,
                };
            }
            SessionLookup::Live(state) => state,
        };

        let credited = verdict.capped_seconds_to_credit;

        if now - state.started_at > self.config.max_session_duration() {
            // Continuous activity: the interval is real study time, credited
            // to the replacement session
            let mut next = fresh(credited);
            next.parallel_session_count = state.parallel_session_count;
            return SessionAdvance {
                state: next,
                status: SessionStatus::RolledOver,
                credited_seconds: credited,
                flagged_seconds: 0.0,
                previous: Some(state),
                newly_suspicious: false,
            };
        }

        state.accumulated_seconds += credited;
        state.heartbeat_count += 1;
        state.last_activity_at = now;
        state.last_client_at = client_timestamp;
        if let Some(interval) = verdict.interval_seconds {
            state.recent_intervals.push(interval);
            let excess = state
                .recent_intervals
                .len()
                .saturating_sub(validator.window_len());
            state.recent_intervals.drain(..excess);
        }

        let mut newly_suspicious = false;
        if let Some(stddev) = validator.interval_stddev(&state.recent_intervals) {
            state.interval_stddev = Some(stddev);
            if !state.is_suspicious && validator.is_bot_like(stddev) {
                state.is_suspicious = true;
                newly_suspicious = true;
            }
        }

        let flagged = if state.is_suspicious { credited } else { 0.0 };
        state.flagged_seconds += flagged;

        SessionAdvance {
            state,
            status: SessionStatus::Continued,
            credited_seconds: credited,
            flagged_seconds: flagged,
            previous: None,
            newly_suspicious,
        }
    }

    /// Persist the session and refresh the user's index.
    /// Caller holds the user lock.
    pub async fn save(&self, state: &SessionState, now: DateTime<Utc>) -> ProgressResult<()> {
        self.write(&Self::state_key(state.user_id, state.subsection_id), state)
            .await?;

        let timeout = self.config.session_timeout();
        let mut index = self.read_index(state.user_id).await?;
        index.retain(|_, entry| now - entry.last_activity_at <= timeout);
        index.insert(
            state.subsection_id,
            IndexEntry {
                session_id: state.session_id,
                last_activity_at: state.last_activity_at,
            },
        );
        self.write(&Self::index_key(state.user_id), &index).await
    }

    /// End the session explicitly. Caller holds the user lock.
    pub async fn close(
        &self,
        user_id: i64,
        subsection_id: i64,
    ) -> ProgressResult<Option<SessionState>> {
        let state = self
            .read::<SessionState>(&Self::state_key(user_id, subsection_id))
            .await?;
        self.cache
            .delete(&Self::state_key(user_id, subsection_id))
            .await?;

        let mut index = self.read_index(user_id).await?;
        if index.remove(&subsection_id).is_some() {
            self.write(&Self::index_key(user_id), &index).await?;
        }
        Ok(state)
    }
}
