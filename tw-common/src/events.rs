//! Event types for the TestWise event system
//!
//! Engine components emit [`ProgressEvent`]s on an [`EventBus`]; any number of
//! listeners (audit log, notification fan-out, tests) may subscribe.

use crate::status::{AttemptStatus, ProgressStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Progress engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    /// A new viewing session opened for (user, subsection)
    SessionStarted {
        user_id: i64,
        subsection_id: i64,
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A session hit the maximum continuous duration and was replaced
    SessionRolledOver {
        user_id: i64,
        subsection_id: i64,
        previous_session_id: Uuid,
        session_id: Uuid,
        /// Seconds credited by the session that just closed
        previous_accumulated_seconds: f64,
        timestamp: DateTime<Utc>,
    },

    /// A session was closed explicitly by the client
    SessionClosed {
        user_id: i64,
        subsection_id: i64,
        session_id: Uuid,
        accumulated_seconds: f64,
        timestamp: DateTime<Utc>,
    },

    /// Heartbeat cadence looked machine-generated
    SuspiciousActivity {
        user_id: i64,
        subsection_id: i64,
        session_id: Uuid,
        /// Sample standard deviation of the observed intervals, seconds
        interval_stddev: f64,
        timestamp: DateTime<Utc>,
    },

    /// Tracked time reached the subsection's required minimum
    SubsectionCompleted {
        user_id: i64,
        subsection_id: i64,
        time_spent_seconds: f64,
        timestamp: DateTime<Utc>,
    },

    /// Section completion was recomputed and changed
    SectionProgressChanged {
        user_id: i64,
        section_id: i64,
        completion_percentage: f64,
        status: ProgressStatus,
        timestamp: DateTime<Utc>,
    },

    /// Topic completion was recomputed and changed
    TopicProgressChanged {
        user_id: i64,
        topic_id: i64,
        completion_percentage: f64,
        status: ProgressStatus,
        timestamp: DateTime<Utc>,
    },

    /// Test attempt moved to a new lifecycle state
    AttemptStatusChanged {
        attempt_id: i64,
        test_id: i64,
        user_id: i64,
        old_status: AttemptStatus,
        new_status: AttemptStatus,
        timestamp: DateTime<Utc>,
    },

    /// Test attempt deadline was pushed back because the student is active
    AttemptExtended {
        attempt_id: i64,
        user_id: i64,
        auto_extend_count: u32,
        expires_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Short name for log lines
    pub fn event_type(&self) -> &'static str {
        match self {
            ProgressEvent::SessionStarted { .. } => "SessionStarted",
            ProgressEvent::SessionRolledOver { .. } => "SessionRolledOver",
            ProgressEvent::SessionClosed { .. } => "SessionClosed",
            ProgressEvent::SuspiciousActivity { .. } => "SuspiciousActivity",
            ProgressEvent::SubsectionCompleted { .. } => "SubsectionCompleted",
            ProgressEvent::SectionProgressChanged { .. } => "SectionProgressChanged",
            ProgressEvent::TopicProgressChanged { .. } => "TopicProgressChanged",
            ProgressEvent::AttemptStatusChanged { .. } => "AttemptStatusChanged",
            ProgressEvent::AttemptExtended { .. } => "AttemptExtended",
        }
    }
}

/// Broadcast channel for [`ProgressEvent`]s
///
/// Slow subscribers lose the oldest events once `capacity` is exceeded;
/// emitters never block.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ProgressEvent,
    ) -> Result<usize, broadcast::error::SendError<ProgressEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
