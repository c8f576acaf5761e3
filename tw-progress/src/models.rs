//! Content hierarchy, progress rows and content-type tags

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tw_common::{Error, ProgressStatus, Result};
use uuid::Uuid;

/// Weight-table key for a piece of content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    SubsectionText,
    SubsectionPdf,
    SubsectionVideo,
    TestHinted,
    TestSectionFinal,
    TestGlobalFinal,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::SubsectionText => "SUBSECTION_TEXT",
            ContentType::SubsectionPdf => "SUBSECTION_PDF",
            ContentType::SubsectionVideo => "SUBSECTION_VIDEO",
            ContentType::TestHinted => "TEST_HINTED",
            ContentType::TestSectionFinal => "TEST_SECTION_FINAL",
            ContentType::TestGlobalFinal => "TEST_GLOBAL_FINAL",
        }
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUBSECTION_TEXT" => Ok(ContentType::SubsectionText),
            "SUBSECTION_PDF" => Ok(ContentType::SubsectionPdf),
            "SUBSECTION_VIDEO" => Ok(ContentType::SubsectionVideo),
            "TEST_HINTED" => Ok(ContentType::TestHinted),
            "TEST_SECTION_FINAL" => Ok(ContentType::TestSectionFinal),
            "TEST_GLOBAL_FINAL" => Ok(ContentType::TestGlobalFinal),
            other => Err(Error::InvalidInput(format!("Unknown content type: {}", other))),
        }
    }
}

/// Kind of material a subsection presents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubsectionKind {
    Text,
    Pdf,
    Video,
    Presentation,
}

impl SubsectionKind {
    /// Presentations are weighted like text
    pub fn content_type(self) -> ContentType {
        match self {
            SubsectionKind::Text | SubsectionKind::Presentation => ContentType::SubsectionText,
            SubsectionKind::Pdf => ContentType::SubsectionPdf,
            SubsectionKind::Video => ContentType::SubsectionVideo,
        }
    }
}

impl FromStr for SubsectionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TEXT" => Ok(SubsectionKind::Text),
            "PDF" => Ok(SubsectionKind::Pdf),
            "VIDEO" => Ok(SubsectionKind::Video),
            "PRESENTATION" => Ok(SubsectionKind::Presentation),
            other => Err(Error::InvalidInput(format!("Unknown subsection kind: {}", other))),
        }
    }
}

/// Role a test plays in gating progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestKind {
    /// Practice test, never gates anything
    Hinted,
    /// Closes a section
    SectionFinal,
    /// Closes a topic
    GlobalFinal,
}

impl TestKind {
    pub fn content_type(self) -> ContentType {
        match self {
            TestKind::Hinted => ContentType::TestHinted,
            TestKind::SectionFinal => ContentType::TestSectionFinal,
            TestKind::GlobalFinal => ContentType::TestGlobalFinal,
        }
    }
}

impl FromStr for TestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HINTED" => Ok(TestKind::Hinted),
            "SECTION_FINAL" => Ok(TestKind::SectionFinal),
            "GLOBAL_FINAL" => Ok(TestKind::GlobalFinal),
            other => Err(Error::InvalidInput(format!("Unknown test kind: {}", other))),
        }
    }
}

/// Resource kinds named in access checks and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Topic,
    Section,
    Subsection,
    Test,
    Attempt,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Topic => "topic",
            ResourceKind::Section => "section",
            ResourceKind::Subsection => "subsection",
            ResourceKind::Test => "test",
            ResourceKind::Attempt => "attempt",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub title: String,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: i64,
    pub topic_id: i64,
    pub title: String,
    pub position: i64,
    pub weight: f64,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subsection {
    pub id: i64,
    pub section_id: i64,
    pub title: String,
    pub kind: SubsectionKind,
    pub position: i64,
    /// Overrides the tracking default when set
    pub min_time_seconds: Option<i64>,
    /// Overrides the content-type weight when set
    pub weight: Option<f64>,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: i64,
    pub title: String,
    pub kind: TestKind,
    /// Set for hinted and section-final tests
    pub section_id: Option<i64>,
    /// Set for global-final tests
    pub topic_id: Option<i64>,
    /// Score (0-100) an attempt needs to count as passed
    pub passing_score: f64,
    /// Section content completion required before a section final opens
    pub required_completion: Option<f64>,
    pub duration_minutes: Option<i64>,
    pub max_attempts: Option<u32>,
    pub is_archived: bool,
}

/// Persisted per-(user, subsection) tracking row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsectionProgress {
    pub user_id: i64,
    pub subsection_id: i64,
    pub status: ProgressStatus,
    pub time_spent_seconds: f64,
    /// Portion of `time_spent_seconds` credited while the session was flagged
    pub flagged_seconds: f64,
    pub completion_percentage: f64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubsectionProgress {
    pub fn new(user_id: i64, subsection_id: i64) -> Self {
        Self {
            user_id,
            subsection_id,
            status: ProgressStatus::Started,
            time_spent_seconds: 0.0,
            flagged_seconds: 0.0,
            completion_percentage: 0.0,
            last_activity_at: None,
            completed_at: None,
        }
    }
}

/// Derived section or topic row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateProgress {
    pub user_id: i64,
    /// Section id or topic id depending on the table
    pub resource_id: i64,
    pub status: ProgressStatus,
    pub completion_percentage: f64,
    pub updated_at: DateTime<Utc>,
}

impl AggregateProgress {
    /// Same exposed percentage and status (updated_at ignored)
    pub fn same_state(&self, other: &AggregateProgress) -> bool {
        self.status == other.status
            && (self.completion_percentage - other.completion_percentage).abs() < 0.005
    }
}

/// How a viewing session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEndReason {
    /// Page closed by the student
    Closed,
    /// Silent past the session timeout
    TimedOut,
    /// Reached the maximum session duration and was replaced
    RolledOver,
}

impl SessionEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionEndReason::Closed => "CLOSED",
            SessionEndReason::TimedOut => "TIMED_OUT",
            SessionEndReason::RolledOver => "ROLLED_OVER",
        }
    }
}

impl FromStr for SessionEndReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CLOSED" => Ok(SessionEndReason::Closed),
            "TIMED_OUT" => Ok(SessionEndReason::TimedOut),
            "ROLLED_OVER" => Ok(SessionEndReason::RolledOver),
            other => Err(Error::Internal(format!("Unknown session end reason: {}", other))),
        }
    }
}

/// Audit row of one viewing session
///
/// Written with every accepted heartbeat, so a session abandoned without a
/// close still leaves a row (`ended_at` unset) covering its last activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySession {
    pub session_id: Uuid,
    pub user_id: i64,
    pub subsection_id: i64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<SessionEndReason>,
    pub accumulated_seconds: f64,
    pub flagged_seconds: f64,
    pub heartbeat_count: u32,
    pub is_suspicious: bool,
    pub interval_stddev: Option<f64>,
}

impl ActivitySession {
    pub fn duration_seconds(&self) -> f64 {
        let end = self.ended_at.unwrap_or(self.last_activity_at);
        tw_common::time::seconds_between(self.started_at, end)
    }
}
