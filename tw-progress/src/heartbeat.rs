//! Heartbeat admission: sliding-window rate limiting, cadence validation
//! and bot detection

use crate::cache::{CacheClient, CacheError};
use crate::config::TrackingConfig;
use crate::error::{ProgressError, ProgressResult};
use crate::session::SessionState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use tw_common::retry::retry_once;
use tw_common::time::seconds_between;

/// Sliding-window limiter keyed per (user, subsection)
///
/// Each admitted request's timestamp is kept in the cache; a request is
/// refused once `limit` timestamps fall inside the trailing window. A refused
/// request does not take a slot. Callers must hold the (user, subsection)
/// lock between `check` and `record`.
pub struct RateLimiter {
    cache: Arc<dyn CacheClient>,
    limit: usize,
    window: Duration,
}

/// Limiter verdict for one request
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed { remaining: usize },
    Limited { retry_after_seconds: f64 },
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheClient>, config: &TrackingConfig) -> Self {
        Self {
            cache,
            limit: config.rate_limit(),
            window: Duration::seconds(config.rate_limit_window_seconds as i64),
        }
    }

    fn key(user_id: i64, subsection_id: i64) -> String {
        format!("heartbeat:{}:{}", user_id, subsection_id)
    }

    fn rejections_key(user_id: i64, subsection_id: i64) -> String {
        format!("heartbeat:rejected:{}:{}", user_id, subsection_id)
    }

    async fn admitted(&self, key: &str, now: DateTime<Utc>) -> ProgressResult<Vec<i64>> {
        let cutoff = (now - self.window).timestamp_millis();
        let stored = retry_once("rate limit read", || self.cache.get(key)).await?;
        let mut admitted: Vec<i64> = match stored {
            Some(value) => serde_json::from_value(value).map_err(|e| CacheError::Malformed {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        admitted.retain(|ts| *ts > cutoff);
        Ok(admitted)
    }

    /// Decide whether the request fits in the window. Nothing is recorded;
    /// call [`RateLimiter::record`] once the request has been admitted.
    pub async fn check(
        &self,
        user_id: i64,
        subsection_id: i64,
        now: DateTime<Utc>,
    ) -> ProgressResult<RateDecision> {
        let admitted = self.admitted(&Self::key(user_id, subsection_id), now).await?;

        if admitted.len() >= self.limit {
            let cutoff = (now - self.window).timestamp_millis();
            let oldest = admitted.iter().copied().min().unwrap_or(cutoff);
            let retry_after_ms = (oldest - cutoff).max(0);
            let rejected = self
                .cache
                .incr(&Self::rejections_key(user_id, subsection_id), 1, self.window)
                .await
                .unwrap_or(0);
            warn!(
                user_id,
                subsection_id,
                admitted = admitted.len(),
                rejected_in_window = rejected,
                "Heartbeat rate limit exceeded"
            );
            return Ok(RateDecision::Limited {
                retry_after_seconds: retry_after_ms as f64 / 1000.0,
            });
        }

        Ok(RateDecision::Allowed {
            remaining: self.limit - admitted.len() - 1,
        })
    }

    /// Take a slot in the window for an admitted request
    pub async fn record(
        &self,
        user_id: i64,
        subsection_id: i64,
        now: DateTime<Utc>,
    ) -> ProgressResult<()> {
        let key = Self::key(user_id, subsection_id);
        let mut admitted = self.admitted(&key, now).await?;
        admitted.push(now.timestamp_millis());
        self.cache
            .set(&key, Value::from(admitted), self.window)
            .await?;
        Ok(())
    }
}

/// Why a heartbeat was accepted or rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    /// Opens a session, nothing to credit yet
    FirstHeartbeat,
    Accepted,
    /// Accepted, but the gap was longer than the credit cap
    IntervalCapped,
    /// Arrived sooner than the minimum interval after the previous one
    TooFrequent,
    /// Client timestamp not newer than one already applied (retry/replay)
    Stale,
}

/// `{accepted, reason, capped_seconds_to_credit, is_suspicious}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatVerdict {
    pub accepted: bool,
    pub reason: VerdictReason,
    /// Server-measured gap since the previous heartbeat of the session
    pub interval_seconds: Option<f64>,
    pub capped_seconds_to_credit: f64,
    pub is_suspicious: bool,
}

impl HeartbeatVerdict {
    fn rejected(reason: VerdictReason, interval_seconds: Option<f64>, is_suspicious: bool) -> Self {
        Self {
            accepted: false,
            reason,
            interval_seconds,
            capped_seconds_to_credit: 0.0,
            is_suspicious,
        }
    }
}

/// Cadence checks against the live session of a (user, subsection)
#[derive(Debug, Clone)]
pub struct HeartbeatValidator {
    min_interval_seconds: f64,
    max_interval_seconds: f64,
    stddev_threshold: f64,
    min_observations: u32,
}

impl HeartbeatValidator {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            min_interval_seconds: config.min_interval_seconds,
            max_interval_seconds: config.max_interval_seconds,
            stddev_threshold: config.suspicious_stddev_threshold,
            min_observations: config.min_intervals_for_detection,
        }
    }

    /// Judge one heartbeat. `live` is the session it would extend, or None
    /// if it would open a new one.
    pub fn validate(
        &self,
        live: Option<&SessionState>,
        now: DateTime<Utc>,
        client_timestamp: DateTime<Utc>,
    ) -> HeartbeatVerdict {
        let Some(session) = live else {
            return HeartbeatVerdict {
                accepted: true,
                reason: VerdictReason::FirstHeartbeat,
                interval_seconds: None,
                capped_seconds_to_credit: 0.0,
                is_suspicious: false,
            };
        };

        if client_timestamp <= session.last_client_at {
            return HeartbeatVerdict::rejected(VerdictReason::Stale, None, session.is_suspicious);
        }

        let interval = seconds_between(session.last_activity_at, now);
        if interval < self.min_interval_seconds {
            return HeartbeatVerdict::rejected(
                VerdictReason::TooFrequent,
                Some(interval),
                session.is_suspicious,
            );
        }

        let capped = interval.min(self.max_interval_seconds);
        let reason = if interval > self.max_interval_seconds {
            VerdictReason::IntervalCapped
        } else {
            VerdictReason::Accepted
        };

        HeartbeatVerdict {
            accepted: true,
            reason,
            interval_seconds: Some(interval),
            capped_seconds_to_credit: capped,
            is_suspicious: session.is_suspicious,
        }
    }

    /// Sample standard deviation of the session's intervals once enough
    /// intervals have been observed to judge, else None
    pub fn interval_stddev(&self, intervals: &[f64]) -> Option<f64> {
        if intervals.len() < self.min_observations as usize || intervals.len() < 2 {
            return None;
        }
        sample_stddev(intervals)
    }

    /// Machine-regular cadence: stddev below the threshold
    pub fn is_bot_like(&self, stddev: f64) -> bool {
        stddev < self.stddev_threshold
    }

    /// Number of recent intervals a session keeps for detection
    pub fn window_len(&self) -> usize {
        (self.min_observations as usize).max(2)
    }
}

pub fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use chrono::TimeZone;
    use tw_common::ManualClock;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn session_at(last: DateTime<Utc>) -> SessionState {
        SessionState {
            session_id: Uuid::new_v4(),
            user_id: 1,
            subsection_id: 2,
            started_at: last,
            last_activity_at: last,
            last_client_at: last,
            accumulated_seconds: 0.0,
            flagged_seconds: 0.0,
            heartbeat_count: 1,
            recent_intervals: Vec::new(),
            is_suspicious: false,
            interval_stddev: None,
            parallel_session_count: 1,
        }
    }

    #[test]
    fn test_first_heartbeat_credits_nothing() {
        let validator = HeartbeatValidator::new(&TrackingConfig::default());
        let verdict = validator.validate(None, t0(), t0());
        assert!(verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::FirstHeartbeat);
        assert_eq!(verdict.capped_seconds_to_credit, 0.0);
    }

    #[test]
    fn test_interval_below_minimum_is_rejected() {
        let validator = HeartbeatValidator::new(&TrackingConfig::default());
        let session = session_at(t0());

        let now = t0() + Duration::milliseconds(4999);
        let verdict = validator.validate(Some(&session), now, now);
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::TooFrequent);

        let now = t0() + Duration::seconds(5);
        assert!(validator.validate(Some(&session), now, now).accepted);
    }

    #[test]
    fn test_long_gap_is_capped() {
        let validator = HeartbeatValidator::new(&TrackingConfig::default());
        let session = session_at(t0());
        let now = t0() + Duration::seconds(300);

        let verdict = validator.validate(Some(&session), now, now);
        assert!(verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::IntervalCapped);
        assert_eq!(verdict.capped_seconds_to_credit, 60.0);
        assert_eq!(verdict.interval_seconds, Some(300.0));
    }

    #[test]
    fn test_replayed_client_timestamp_is_stale() {
        let validator = HeartbeatValidator::new(&TrackingConfig::default());
        let session = session_at(t0());
        let now = t0() + Duration::seconds(7);

        let verdict = validator.validate(Some(&session), now, t0());
        assert!(!verdict.accepted);
        assert_eq!(verdict.reason, VerdictReason::Stale);
    }

    #[test]
    fn test_stddev_needs_enough_observations() {
        let validator = HeartbeatValidator::new(&TrackingConfig::default());
        // Ten heartbeats give only nine intervals
        assert_eq!(validator.interval_stddev(&[7.0; 9]), None);
        let stddev = validator.interval_stddev(&[7.0; 10]).unwrap();
        assert!(validator.is_bot_like(stddev));

        let human = vec![6.0, 9.5, 7.2, 12.0, 5.5, 8.8, 7.0, 15.0, 6.1, 10.4];
        let stddev = validator.interval_stddev(&human).unwrap();
        assert!(!validator.is_bot_like(stddev));
    }

    #[test]
    fn test_sample_stddev() {
        assert_eq!(sample_stddev(&[1.0]), None);
        let sd = sample_stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((sd - 2.138).abs() < 0.001);
    }

    async fn admit(limiter: &RateLimiter, subsection_id: i64, now: DateTime<Utc>) -> RateDecision {
        let decision = limiter.check(1, subsection_id, now).await.unwrap();
        if matches!(decision, RateDecision::Allowed { .. }) {
            limiter.record(1, subsection_id, now).await.unwrap();
        }
        decision
    }

    #[tokio::test]
    async fn test_rate_limit_boundary() {
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let limiter = RateLimiter::new(cache, &TrackingConfig::default());

        // 12 requests inside one minute are admitted
        for i in 0..12 {
            let now = t0() + Duration::seconds(i * 4);
            let decision = admit(&limiter, 2, now).await;
            assert!(matches!(decision, RateDecision::Allowed { .. }), "request {}", i);
        }

        // 13th in the same rolling minute is refused
        let now = t0() + Duration::seconds(50);
        let decision = admit(&limiter, 2, now).await;
        match decision {
            RateDecision::Limited { retry_after_seconds } => {
                assert!((retry_after_seconds - 10.0).abs() < 1e-9)
            }
            other => panic!("expected Limited, got {:?}", other),
        }

        // Another key is unaffected
        assert!(matches!(
            admit(&limiter, 3, now).await,
            RateDecision::Allowed { .. }
        ));

        // Once the first request leaves the window, one slot frees up
        let now = t0() + Duration::milliseconds(60_001);
        assert!(matches!(
            admit(&limiter, 2, now).await,
            RateDecision::Allowed { remaining: 0 }
        ));
    }

    #[tokio::test]
    async fn test_checked_but_unrecorded_request_takes_no_slot() {
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let limiter = RateLimiter::new(cache, &TrackingConfig::default());

        for i in 0..20 {
            let now = t0() + Duration::seconds(i);
            assert!(matches!(
                limiter.check(1, 2, now).await.unwrap(),
                RateDecision::Allowed { remaining: 11 }
            ));
        }
    }
}
