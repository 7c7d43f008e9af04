//! Config module tests

use super::*;

use std::io::Write;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("VS_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${VS_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("VS_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("VS_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${VS_TEST_VAR_UNSET:-fallback}\"");
    assert_eq!(result, "value = \"fallback\"");

    // Set var should use env value
    std::env::set_var("VS_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${VS_TEST_VAR_SET:-fallback}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("VS_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("VS_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${VS_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("VS_TEST_SERVICE", "RooCode-subst");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[sync]
service_name = "${{VS_TEST_SERVICE}}"
port = ${{VS_TEST_PORT:-9200}}
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.sync.service_name, "RooCode-subst");
    assert_eq!(config.sync.port, 9200); // Uses default

    std::env::remove_var("VS_TEST_SERVICE");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert!(config.sync.enabled);
    assert_eq!(config.sync.port, 8765);
    assert_eq!(config.sync.discovery_port, 8766);
    assert_eq!(config.sync.max_connections, 10);
    assert!(config.sync.service_name.starts_with("RooCode-"));
    assert_eq!(config.sync.consecutive_mistake_limit, None);
    assert_eq!(config.heartbeat.interval, Duration::from_secs(30));
    assert_eq!(config.heartbeat.grace, Duration::from_secs(5));
    assert_eq!(config.log.level, "info");
}

#[test]
fn test_parse_partial_config() {
    let config = Config::parse(
        r#"
[sync]
port = 9100
max_connections = 2

[log]
level = "debug"
"#,
    )
    .unwrap();
    assert_eq!(config.sync.port, 9100);
    assert_eq!(config.sync.max_connections, 2);
    // Untouched fields keep their defaults
    assert_eq!(config.sync.discovery_port, 8766);
    assert_eq!(config.log.level, "debug");
}

#[test]
fn test_parse_heartbeat_durations() {
    let config = Config::parse(
        r#"
[heartbeat]
interval = "10s"
grace = "500ms"
"#,
    )
    .unwrap();
    assert_eq!(config.heartbeat.interval, Duration::from_secs(10));
    assert_eq!(config.heartbeat.grace, Duration::from_millis(500));
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let config = Config::load("/nonexistent/visionsync.toml").unwrap();
    assert_eq!(config.sync.port, 8765);
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[sync]
enabled = false
service_name = "RooCode-test"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert!(!config.sync.enabled);
    assert_eq!(config.sync.service_name, "RooCode-test");
}

#[test]
fn test_validation_rejects_zero_max_connections() {
    let err = Config::parse("[sync]\nmax_connections = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_validation_rejects_port_collision() {
    let err = Config::parse("[sync]\nport = 9000\ndiscovery_port = 9000\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_mistake_limit_parses() {
    let config = Config::parse("[sync]\nconsecutive_mistake_limit = 3\n").unwrap();
    assert_eq!(config.sync.consecutive_mistake_limit, Some(3));
}
