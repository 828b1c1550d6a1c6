//! Integration tests for the config module
//!
//! - loader: file I/O, JSON parsing, defaults for missing fields
//! - RunConfig: validation and the values the orchestrator derives from it

use buildrelay::config::loader;
use buildrelay::error::ConfigError;
use buildrelay::{ArchiverKind, PlatformVariant, RunConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_global_config_path_is_json_under_app_dir() {
    if let Ok(path) = loader::get_global_config_path() {
        assert!(path.ends_with("buildrelay/config.json"));
        assert!(loader::validate_config_path(&path).is_ok());
    }
}

#[test]
fn test_minimal_file_takes_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("run.json");
    fs::write(
        &path,
        r#"{
            "workspace_root": "/srv/chromium",
            "final_prefix": "ungoogled-chromium",
            "archiver": "command",
            "retry": { "max_attempts": 3, "backoff_secs": 2 }
        }"#,
    )
    .unwrap();

    let (config, source) = loader::load_or_default(Some(&path)).expect("Config should load");
    assert_eq!(source.as_deref(), Some(path.as_path()));
    assert_eq!(config.workspace_root, PathBuf::from("/srv/chromium"));
    assert_eq!(config.archiver, ArchiverKind::Command);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.backoff, Duration::from_secs(2));
    assert_eq!(config.final_artifact_name(PlatformVariant::X86), "ungoogled-chromium-x86");
    assert_eq!(config.checkpoint_artifact_name(PlatformVariant::X86), "build-artifact-x86");
    assert_eq!(config.output_path(), PathBuf::from("/srv/chromium/build"));
    assert_eq!(config.retention_days, 1);
}

#[test]
fn test_explicit_missing_file_is_an_error() {
    let result = loader::load_or_default(Some(Path::new("/nonexistent/buildrelay.json")));
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_non_json_path_is_rejected_before_reading() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("run.toml");
    fs::write(&path, "workspace_root = '/w'").unwrap();
    assert!(matches!(
        loader::load_config_from_file(&path),
        Err(ConfigError::ValidationFailed(_))
    ));
}

#[test]
fn test_invalid_values_in_file_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("run.json");

    for body in [
        r#"{"archive_level": 10}"#,
        r#"{"build_program": ""}"#,
        r#"{"checkpoint_prefix": "a/b"}"#,
        r#"{"checkpoint_subdir": "../outside"}"#,
    ] {
        fs::write(&path, body).unwrap();
        assert!(
            matches!(loader::load_config_from_file(&path), Err(ConfigError::ValidationFailed(_))),
            "{} should be rejected",
            body
        );
    }
}

#[test]
fn test_saved_config_reloads_identically() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested/dir/run.json");

    let mut config = RunConfig::for_workspace("/w");
    config.package_pattern = "ungoogled-chromium_*".to_string();
    config.settle_delay_secs = 0;
    config.echo_build_output = false;

    loader::save_config_to_file(&config, &path).expect("Save should create parent dirs");
    let reloaded = loader::load_config_from_file(&path).unwrap();
    assert_eq!(reloaded, config);
}
