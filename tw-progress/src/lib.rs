//! # TestWise Progress Engine (tw-progress)
//!
//! Verifies study activity and tracks completion for the TestWise
//! educational backend.
//!
//! **Purpose:** Turn heartbeats sent while a student views a subsection
//! into verified study time, aggregate completion across the
//! subsection → section → topic hierarchy using content-type weights, gate
//! access and test availability behind short-TTL caches, and run the timed
//! test-attempt lifecycle.
//!
//! **Architecture:** Pure decision logic (`heartbeat`, `session`,
//! `aggregator`, `attempt`) behind an [`Engine`] facade that owns the
//! injected collaborators: a [`store::ProgressStore`], a
//! [`cache::CacheClient`] and a [`tw_common::Clock`].

pub mod access;
pub mod aggregator;
pub mod attempt;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod locks;
pub mod models;
pub mod session;
pub mod store;
pub mod weights;

pub use engine::{Engine, HeartbeatReceipt, SubsectionStatusView, SweepReport, TopicProgressView};
pub use error::{ProgressError, ProgressResult};
