//! Status enums shared between the engine, its store and the event bus
//!
//! Both enums are persisted as their SCREAMING_SNAKE_CASE names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Completion status of a subsection, section or topic
///
/// Variants are ordered so that `a < b` means `b` is further along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Started,
    InProgress,
    Completed,
}

impl ProgressStatus {
    /// Contribution of an item in this status to its parent's completion
    pub fn score(self) -> f64 {
        match self {
            ProgressStatus::Started => 0.0,
            ProgressStatus::InProgress => 50.0,
            ProgressStatus::Completed => 100.0,
        }
    }

    /// Forward-only merge: never moves a status backwards
    pub fn advance_to(self, candidate: ProgressStatus) -> ProgressStatus {
        self.max(candidate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Started => "STARTED",
            ProgressStatus::InProgress => "IN_PROGRESS",
            ProgressStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "STARTED" => Ok(ProgressStatus::Started),
            "IN_PROGRESS" => Ok(ProgressStatus::InProgress),
            "COMPLETED" => Ok(ProgressStatus::Completed),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown progress status: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of a timed test attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    /// Opened, no answer recorded yet
    Started,
    /// At least one answer recorded
    InProgress,
    /// Submitted and scored at or above the passing score
    Completed,
    /// Submitted and scored below the passing score
    Failed,
    /// Deadline passed before submission
    Expired,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptStatus::Completed | AttemptStatus::Failed | AttemptStatus::Expired
        )
    }

    /// Open attempts still accept answers and can expire
    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Started => "STARTED",
            AttemptStatus::InProgress => "IN_PROGRESS",
            AttemptStatus::Completed => "COMPLETED",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "STARTED" => Ok(AttemptStatus::Started),
            "IN_PROGRESS" => Ok(AttemptStatus::InProgress),
            "COMPLETED" => Ok(AttemptStatus::Completed),
            "FAILED" => Ok(AttemptStatus::Failed),
            "EXPIRED" => Ok(AttemptStatus::Expired),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown attempt status: {}",
                other
            ))),
        }
    }
}
