//! Config file resolution and loading tests
//!
//! Tests that touch process environment variables run serially.

use serde::Deserialize;
use serial_test::serial;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tw_common::config::{load_toml_or_default, resolve_config_path};

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
struct SampleConfig {
    name: String,
    retries: u32,
}

const ENV_VAR: &str = "TW_COMMON_TEST_CONFIG";

#[test]
#[serial]
fn test_cli_argument_wins_over_environment() {
    std::env::set_var(ENV_VAR, "/from/env.toml");
    let path = resolve_config_path(Some(Path::new("/from/cli.toml")), ENV_VAR, "x.toml");
    std::env::remove_var(ENV_VAR);

    assert_eq!(path, Some(PathBuf::from("/from/cli.toml")));
}

#[test]
#[serial]
fn test_environment_used_without_cli_argument() {
    std::env::set_var(ENV_VAR, "/from/env.toml");
    let path = resolve_config_path(None, ENV_VAR, "x.toml");
    std::env::remove_var(ENV_VAR);

    assert_eq!(path, Some(PathBuf::from("/from/env.toml")));
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let cfg: SampleConfig = load_toml_or_default(Some(&dir.path().join("absent.toml"))).unwrap();
    assert_eq!(cfg, SampleConfig::default());

    let cfg: SampleConfig = load_toml_or_default(None).unwrap();
    assert_eq!(cfg, SampleConfig::default());
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sample.toml");
    std::fs::write(&path, "retries = 4\n").unwrap();

    let cfg: SampleConfig = load_toml_or_default(Some(&path)).unwrap();
    assert_eq!(cfg.retries, 4);
    assert_eq!(cfg.name, "");
}

#[test]
fn test_malformed_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "retries = [unterminated").unwrap();

    let err = load_toml_or_default::<SampleConfig>(Some(&path)).unwrap_err();
    assert!(matches!(err, tw_common::Error::Config(_)));
}
