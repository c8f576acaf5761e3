//! Engine configuration
//!
//! Resolution order, lowest to highest priority:
//! 1. Compiled defaults (below)
//! 2. TOML file (`--config`, `TW_PROGRESS_CONFIG`, or the user config dir)
//! 3. Rows in the database `settings` table, keyed `<section>.<field>`
//!
//! Cache TTLs are correctness parameters: a cached access decision or
//! progress snapshot may be stale for at most its TTL.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;
use tw_common::db::get_setting;
use tw_common::{Error, Result};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "TW_PROGRESS_CONFIG";

/// Default config file name under the user config dir
pub const CONFIG_FILE_NAME: &str = "progress.toml";

/// Longest duration any minute/hour/second setting may express. Values are
/// converted to `chrono::Duration`, which must not overflow.
const MAX_DURATION_SECONDS: u64 = 7 * 24 * 3600;

/// Ceiling for count-like settings (rate limits, extensions, observations)
const MAX_COUNT: u64 = 10_000;

/// What flagged (suspicious) time does to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionPolicy {
    /// Mark the session for review; credited time still counts
    #[default]
    FlagOnly,
    /// Time credited while a session is flagged does not count toward completion
    Exclude,
}

impl FromStr for SuspicionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flag_only" => Ok(SuspicionPolicy::FlagOnly),
            "exclude" => Ok(SuspicionPolicy::Exclude),
            other => Err(Error::Config(format!("Unknown suspicion policy: {}", other))),
        }
    }
}

/// Heartbeat cadence, rate limiting, sessions and bot detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Cadence the client is expected to use
    pub heartbeat_interval_seconds: f64,
    /// Heartbeats closer together than this are rejected
    pub min_interval_seconds: f64,
    /// Longest interval credited as active time
    pub max_interval_seconds: f64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub rate_limit_window_seconds: u64,
    pub max_session_hours: u64,
    pub max_parallel_sessions: u32,
    /// A session with activity inside this window counts as open
    pub parallel_session_window_minutes: u64,
    pub session_timeout_minutes: u64,
    pub suspicious_stddev_threshold: f64,
    pub min_intervals_for_detection: u32,
    pub default_min_time_seconds: u64,
    pub completion_time_multiplier: f64,
    pub suspicious_policy: SuspicionPolicy,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 7.0,
            min_interval_seconds: 5.0,
            max_interval_seconds: 60.0,
            rate_limit_per_minute: 10,
            rate_limit_burst: 2,
            rate_limit_window_seconds: 60,
            max_session_hours: 2,
            max_parallel_sessions: 3,
            parallel_session_window_minutes: 5,
            session_timeout_minutes: 30,
            suspicious_stddev_threshold: 1.0,
            min_intervals_for_detection: 10,
            default_min_time_seconds: 30,
            completion_time_multiplier: 1.0,
            suspicious_policy: SuspicionPolicy::FlagOnly,
        }
    }
}

impl TrackingConfig {
    /// Hard cap on admitted heartbeats per key per window
    pub fn rate_limit(&self) -> usize {
        (self.rate_limit_per_minute + self.rate_limit_burst) as usize
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_timeout_minutes as i64)
    }

    pub fn max_session_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_session_hours as i64)
    }

    pub fn parallel_session_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.parallel_session_window_minutes as i64)
    }

    /// Seconds of tracked time a subsection needs before it is COMPLETED
    pub fn required_seconds(&self, min_time_seconds: Option<i64>) -> f64 {
        let base = min_time_seconds
            .filter(|s| *s >= 0)
            .map(|s| s as f64)
            .unwrap_or(self.default_min_time_seconds as f64);
        base * self.completion_time_multiplier
    }
}

/// Aggregation thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// A section (or topic) is passed at or above this completion
    pub section_completion_threshold: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            section_completion_threshold: 80.0,
        }
    }
}

/// Cache TTLs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub access_ttl_seconds: u64,
    pub progress_ttl_seconds: u64,
    pub weights_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            access_ttl_seconds: 600,
            progress_ttl_seconds: 300,
            weights_ttl_seconds: 3600,
        }
    }
}

/// Timed test attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptConfig {
    /// Added to the test duration when computing `expires_at`
    pub expiry_grace_seconds: u64,
    pub max_auto_extensions: u32,
    pub auto_extension_minutes: u64,
    /// Extensions are only considered this close to the deadline
    pub extension_warning_minutes: u64,
    /// Activity newer than this counts as "actively answering"
    pub activity_window_seconds: u64,
    /// Untimed attempts idle this long are expired by the sweeper
    pub stale_attempt_hours: u64,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            expiry_grace_seconds: 30,
            max_auto_extensions: 3,
            auto_extension_minutes: 5,
            extension_warning_minutes: 2,
            activity_window_seconds: 120,
            stale_attempt_hours: 24,
        }
    }
}

/// Background maintenance loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file; defaults to `<data dir>/testwise/testwise.db`
    pub database_path: Option<PathBuf>,
    /// Buffered events per event-bus subscriber
    pub event_capacity: Option<usize>,
    pub tracking: TrackingConfig,
    pub progress: ProgressConfig,
    pub cache: CacheConfig,
    pub attempts: AttemptConfig,
    pub sweeper: SweeperConfig,
}

impl EngineConfig {
    /// Load defaults overlaid with the TOML file, if one resolves
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path =
            tw_common::config::resolve_config_path(cli_path, CONFIG_ENV_VAR, CONFIG_FILE_NAME);
        tw_common::config::load_toml_or_default(path.as_deref())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| tw_common::config::default_data_dir().join("testwise.db"))
    }

    pub fn event_capacity(&self) -> usize {
        self.event_capacity.unwrap_or(256)
    }

    /// Apply overrides stored in the `settings` table
    pub async fn apply_settings(&mut self, db: &SqlitePool) -> Result<()> {
        let t = &mut self.tracking;
        override_setting(db, "tracking.heartbeat_interval_seconds", &mut t.heartbeat_interval_seconds).await?;
        override_setting(db, "tracking.min_interval_seconds", &mut t.min_interval_seconds).await?;
        override_setting(db, "tracking.max_interval_seconds", &mut t.max_interval_seconds).await?;
        override_setting(db, "tracking.rate_limit_per_minute", &mut t.rate_limit_per_minute).await?;
        override_setting(db, "tracking.rate_limit_burst", &mut t.rate_limit_burst).await?;
        override_setting(db, "tracking.rate_limit_window_seconds", &mut t.rate_limit_window_seconds).await?;
        override_setting(db, "tracking.max_session_hours", &mut t.max_session_hours).await?;
        override_setting(db, "tracking.max_parallel_sessions", &mut t.max_parallel_sessions).await?;
        override_setting(db, "tracking.parallel_session_window_minutes", &mut t.parallel_session_window_minutes).await?;
        override_setting(db, "tracking.session_timeout_minutes", &mut t.session_timeout_minutes).await?;
        override_setting(db, "tracking.suspicious_stddev_threshold", &mut t.suspicious_stddev_threshold).await?;
        override_setting(db, "tracking.min_intervals_for_detection", &mut t.min_intervals_for_detection).await?;
        override_setting(db, "tracking.default_min_time_seconds", &mut t.default_min_time_seconds).await?;
        override_setting(db, "tracking.completion_time_multiplier", &mut t.completion_time_multiplier).await?;
        override_setting(db, "tracking.suspicious_policy", &mut t.suspicious_policy).await?;

        override_setting(db, "progress.section_completion_threshold", &mut self.progress.section_completion_threshold).await?;

        let c = &mut self.cache;
        override_setting(db, "cache.access_ttl_seconds", &mut c.access_ttl_seconds).await?;
        override_setting(db, "cache.progress_ttl_seconds", &mut c.progress_ttl_seconds).await?;
        override_setting(db, "cache.weights_ttl_seconds", &mut c.weights_ttl_seconds).await?;

        let a = &mut self.attempts;
        override_setting(db, "attempts.expiry_grace_seconds", &mut a.expiry_grace_seconds).await?;
        override_setting(db, "attempts.max_auto_extensions", &mut a.max_auto_extensions).await?;
        override_setting(db, "attempts.auto_extension_minutes", &mut a.auto_extension_minutes).await?;
        override_setting(db, "attempts.extension_warning_minutes", &mut a.extension_warning_minutes).await?;
        override_setting(db, "attempts.activity_window_seconds", &mut a.activity_window_seconds).await?;
        override_setting(db, "attempts.stale_attempt_hours", &mut a.stale_attempt_hours).await?;

        override_setting(db, "sweeper.interval_seconds", &mut self.sweeper.interval_seconds).await?;

        Ok(())
    }

    /// Reject values the engine cannot operate with
    pub fn validate(&self) -> Result<()> {
        let t = &self.tracking;
        if !(t.min_interval_seconds > 0.0) {
            return Err(Error::Config("tracking.min_interval_seconds must be > 0".to_string()));
        }
        if !(t.max_interval_seconds >= t.min_interval_seconds) {
            return Err(Error::Config(
                "tracking.max_interval_seconds must be >= min_interval_seconds".to_string(),
            ));
        }
        seconds_at_most("tracking.max_interval_seconds", t.max_interval_seconds)?;
        if !(t.heartbeat_interval_seconds >= t.min_interval_seconds
            && t.heartbeat_interval_seconds <= t.max_interval_seconds)
        {
            return Err(Error::Config(
                "tracking.heartbeat_interval_seconds must lie between min and max interval"
                    .to_string(),
            ));
        }
        if t.rate_limit_per_minute == 0 || t.rate_limit_window_seconds == 0 {
            return Err(Error::Config("tracking rate limit must allow at least one request".to_string()));
        }
        count_at_most("tracking.rate_limit_per_minute", t.rate_limit_per_minute.into())?;
        count_at_most("tracking.rate_limit_burst", t.rate_limit_burst.into())?;
        duration_at_most("tracking.rate_limit_window_seconds", t.rate_limit_window_seconds, 1)?;
        if t.max_parallel_sessions == 0 {
            return Err(Error::Config("tracking.max_parallel_sessions must be >= 1".to_string()));
        }
        count_at_most("tracking.max_parallel_sessions", t.max_parallel_sessions.into())?;
        if t.session_timeout_minutes == 0 || t.max_session_hours == 0 {
            return Err(Error::Config("tracking session bounds must be > 0".to_string()));
        }
        duration_at_most("tracking.session_timeout_minutes", t.session_timeout_minutes, 60)?;
        duration_at_most("tracking.max_session_hours", t.max_session_hours, 3600)?;
        duration_at_most(
            "tracking.parallel_session_window_minutes",
            t.parallel_session_window_minutes,
            60,
        )?;
        if t.min_intervals_for_detection < 3 {
            return Err(Error::Config("tracking.min_intervals_for_detection must be >= 3".to_string()));
        }
        count_at_most("tracking.min_intervals_for_detection", t.min_intervals_for_detection.into())?;
        if !(t.completion_time_multiplier >= 0.0) {
            return Err(Error::Config("tracking.completion_time_multiplier must be >= 0".to_string()));
        }

        let threshold = self.progress.section_completion_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "progress.section_completion_threshold must be within 0..=100, got {}",
                threshold
            )));
        }

        let c = &self.cache;
        if c.access_ttl_seconds == 0 || c.progress_ttl_seconds == 0 || c.weights_ttl_seconds == 0 {
            return Err(Error::Config("cache TTLs must be > 0".to_string()));
        }
        duration_at_most("cache.access_ttl_seconds", c.access_ttl_seconds, 1)?;
        duration_at_most("cache.progress_ttl_seconds", c.progress_ttl_seconds, 1)?;
        duration_at_most("cache.weights_ttl_seconds", c.weights_ttl_seconds, 1)?;

        let a = &self.attempts;
        duration_at_most("attempts.expiry_grace_seconds", a.expiry_grace_seconds, 1)?;
        count_at_most("attempts.max_auto_extensions", a.max_auto_extensions.into())?;
        duration_at_most("attempts.auto_extension_minutes", a.auto_extension_minutes, 60)?;
        duration_at_most("attempts.extension_warning_minutes", a.extension_warning_minutes, 60)?;
        duration_at_most("attempts.activity_window_seconds", a.activity_window_seconds, 1)?;
        duration_at_most("attempts.stale_attempt_hours", a.stale_attempt_hours, 3600)?;

        if self.sweeper.interval_seconds == 0 {
            return Err(Error::Config("sweeper.interval_seconds must be > 0".to_string()));
        }
        duration_at_most("sweeper.interval_seconds", self.sweeper.interval_seconds, 1)?;

        Ok(())
    }
}

/// `value` is in units of `unit_seconds`
fn duration_at_most(name: &str, value: u64, unit_seconds: u64) -> Result<()> {
    match value.checked_mul(unit_seconds) {
        Some(seconds) if seconds <= MAX_DURATION_SECONDS => Ok(()),
        _ => Err(Error::Config(format!(
            "{} must not exceed {} seconds, got {}",
            name, MAX_DURATION_SECONDS, value
        ))),
    }
}

fn seconds_at_most(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value <= MAX_DURATION_SECONDS as f64 {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{} must not exceed {} seconds, got {}",
            name, MAX_DURATION_SECONDS, value
        )))
    }
}

fn count_at_most(name: &str, value: u64) -> Result<()> {
    if value <= MAX_COUNT {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must not exceed {}, got {}", name, MAX_COUNT, value)))
    }
}

async fn override_setting<T>(db: &SqlitePool, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr + std::fmt::Debug,
{
    if let Some(value) = get_setting::<T>(db, key).await? {
        info!("Setting '{}' overrides configured value: {:?}", key, value);
        *slot = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tracking.heartbeat_interval_seconds, 7.0);
        assert_eq!(cfg.tracking.rate_limit(), 12);
        assert_eq!(cfg.tracking.session_timeout(), chrono::Duration::minutes(30));
        assert_eq!(cfg.progress.section_completion_threshold, 80.0);
        assert_eq!(cfg.cache.access_ttl_seconds, 600);
        assert_eq!(cfg.cache.progress_ttl_seconds, 300);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_required_seconds_uses_multiplier() {
        let mut tracking = TrackingConfig::default();
        assert_eq!(tracking.required_seconds(None), 30.0);
        assert_eq!(tracking.required_seconds(Some(120)), 120.0);

        tracking.completion_time_multiplier = 1.5;
        assert_eq!(tracking.required_seconds(Some(120)), 180.0);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [tracking]
            max_parallel_sessions = 5
            suspicious_policy = "exclude"

            [progress]
            section_completion_threshold = 70.0
            "#,
        )
        .unwrap();

        assert_eq!(cfg.tracking.max_parallel_sessions, 5);
        assert_eq!(cfg.tracking.suspicious_policy, SuspicionPolicy::Exclude);
        assert_eq!(cfg.tracking.min_interval_seconds, 5.0);
        assert_eq!(cfg.progress.section_completion_threshold, 70.0);
        assert_eq!(cfg.attempts.max_auto_extensions, 3);
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut cfg = EngineConfig::default();
        cfg.tracking.min_interval_seconds = 90.0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.progress.section_completion_threshold = 120.0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.cache.access_ttl_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.tracking.heartbeat_interval_seconds = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut cfg = EngineConfig::default();
        cfg.tracking.session_timeout_minutes = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.tracking.max_session_hours = 1 << 40;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.cache.access_ttl_seconds = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.tracking.rate_limit_burst = u32::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.tracking.max_interval_seconds = f64::INFINITY;
        assert!(cfg.validate().is_err());

        // A full week is still allowed
        let mut cfg = EngineConfig::default();
        cfg.attempts.stale_attempt_hours = 7 * 24;
        cfg.cache.weights_ttl_seconds = 7 * 24 * 3600;
        assert!(cfg.validate().is_ok());
    }
}
