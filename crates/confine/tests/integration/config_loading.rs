use std::path::PathBuf;

use confine::{Config, ConfigError, EXAMPLE_CONFIG};

use super::fixture_path;

#[test]
fn test_load_valid_config() {
    let config = Config::from_file(fixture_path("configs/valid_full.toml"))
        .expect("Failed to load config");

    assert_eq!(
        config.supervisor_path,
        Some(PathBuf::from("/usr/local/bin/confine-supervisor"))
    );
    assert_eq!(config.cgroup_root, Some(PathBuf::from("/sys/fs/cgroup/confine")));
    assert_eq!(config.max_parallel_sandboxes, 8);
    assert_eq!(config.shutdown_timeout_ms, 500);
}

#[test]
fn test_load_minimal_config() {
    let config = Config::from_file(fixture_path("configs/valid_minimal.toml"))
        .expect("Failed to load config");

    assert_eq!(config.max_parallel_sandboxes, 2);
    assert_eq!(config.shutdown_timeout_ms, 1000);
}

#[test]
fn test_load_invalid_zero_parallel() {
    let result = Config::from_file(fixture_path("configs/invalid_zero_parallel.toml"));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_invalid_relative_root() {
    let result = Config::from_file(fixture_path("configs/invalid_relative_root.toml"));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_example_config_parses() {
    let config = Config::parse_toml(EXAMPLE_CONFIG).expect("example config should be valid");
    assert_eq!(config, Config::default());
}
