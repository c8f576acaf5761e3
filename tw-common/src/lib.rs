//! # TestWise Common Library
//!
//! Shared code for the TestWise services:
//! - Error types
//! - Progress and attempt status enums
//! - Clock abstraction
//! - Event types (ProgressEvent) and EventBus
//! - Configuration file discovery and loading
//! - Database initialization and settings access
//! - Retry helper for idempotent reads

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod retry;
pub mod status;
pub mod time;

pub use error::{Error, Result};
pub use status::{AttemptStatus, ProgressStatus};
pub use time::{Clock, ManualClock, SystemClock};
