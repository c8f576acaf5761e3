//! Engine configuration: file discovery and database overrides

use serial_test::serial;
use tempfile::TempDir;
use tw_common::db::{init_database, set_setting};
use tw_progress::config::{EngineConfig, SuspicionPolicy, CONFIG_ENV_VAR};

#[test]
#[serial]
fn test_config_file_found_through_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.toml");
    std::fs::write(
        &path,
        "[tracking]\nmax_parallel_sessions = 5\n\n[sweeper]\ninterval_seconds = 10\n",
    )
    .unwrap();

    std::env::set_var(CONFIG_ENV_VAR, &path);
    let cfg = EngineConfig::load(None);
    std::env::remove_var(CONFIG_ENV_VAR);

    let cfg = cfg.unwrap();
    assert_eq!(cfg.tracking.max_parallel_sessions, 5);
    assert_eq!(cfg.sweeper.interval_seconds, 10);
    assert_eq!(cfg.tracking.rate_limit_per_minute, 10);
}

#[test]
#[serial]
fn test_malformed_config_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("progress.toml");
    std::fs::write(&path, "[tracking\nmax_parallel_sessions = ").unwrap();

    let err = EngineConfig::load(Some(&path)).unwrap_err();
    assert!(matches!(err, tw_common::Error::Config(_)));
}

#[tokio::test]
async fn test_database_settings_override_file_values() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("progress.db")).await.unwrap();

    set_setting(&pool, "tracking.suspicious_policy", "exclude").await.unwrap();
    set_setting(&pool, "progress.section_completion_threshold", 70.0).await.unwrap();
    set_setting(&pool, "cache.access_ttl_seconds", 120).await.unwrap();

    let mut cfg = EngineConfig::default();
    cfg.tracking.max_parallel_sessions = 4;
    cfg.apply_settings(&pool).await.unwrap();

    assert_eq!(cfg.tracking.suspicious_policy, SuspicionPolicy::Exclude);
    assert_eq!(cfg.progress.section_completion_threshold, 70.0);
    assert_eq!(cfg.cache.access_ttl_seconds, 120);
    // Not in the database: file value kept
    assert_eq!(cfg.tracking.max_parallel_sessions, 4);
}

#[tokio::test]
async fn test_unparseable_setting_is_reported() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("progress.db")).await.unwrap();
    set_setting(&pool, "tracking.suspicious_policy", "shrug").await.unwrap();

    let mut cfg = EngineConfig::default();
    assert!(cfg.apply_settings(&pool).await.is_err());
}
