//! Configuration Loading Tests
//!
//! Layered TOML loading through `ConfigLoader` using temporary directories.

use std::fs;

use pgbroker::config::{BrokerConfig, ConfigLoader};
use pgbroker::BrokerError;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

#[test]
fn config_has_expected_defaults() {
    let config = BrokerConfig::default();

    assert_eq!(config.database.url, "postgresql://localhost/pgbroker_development");
    assert_eq!(config.database.table_name, "broker_messages");
    assert!(config.database.install_schema);
    assert_eq!(config.channels.max_payload_size, 7800);
    assert_eq!(config.consumer.poll_timeout_ms, 5000);
    assert!(config.consumer.sweep_on_idle);
    assert_eq!(config.reaper.stale_after_secs, None);
    assert!(config.validate().is_ok());
}

#[test]
fn base_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "broker.toml",
        r#"
[database]
table_name = "app_messages"
max_connections = 4

[consumer]
poll_timeout_ms = 1000
"#,
    );

    let config = ConfigLoader::new(dir.path(), "development")
        .without_environment_variables()
        .build()
        .unwrap();

    assert_eq!(config.database.table_name, "app_messages");
    assert_eq!(config.database.max_connections, 4);
    assert_eq!(config.consumer.poll_timeout_ms, 1000);
    // untouched keys keep their defaults
    assert_eq!(config.consumer.max_reconnect_attempts, 10);
    assert_eq!(config.database.url, BrokerConfig::default().database.url);
}

#[test]
fn environment_file_overlays_base_file() {
    let dir = TempDir::new().unwrap();
    write(&dir, "broker.toml", "[consumer]\npoll_timeout_ms = 1000\nsweep_batch_size = 50\n");
    write(
        &dir,
        "broker.production.toml",
        "[consumer]\npoll_timeout_ms = 250\n\n[reaper]\nstale_after_secs = 600\n\n[channels]\nprefix = \"prod\"\n",
    );

    let loader = ConfigLoader::new(dir.path(), "production").without_environment_variables();
    assert_eq!(loader.environment(), "production");
    let config = loader.build().unwrap();

    assert_eq!(config.consumer.poll_timeout_ms, 250);
    assert_eq!(config.consumer.sweep_batch_size, 50);
    assert_eq!(config.reaper.stale_after_secs, Some(600));
    assert_eq!(config.channels.prefix.as_deref(), Some("prod"));

    let development = ConfigLoader::new(dir.path(), "development")
        .without_environment_variables()
        .build()
        .unwrap();
    assert_eq!(development.consumer.poll_timeout_ms, 1000);
    assert_eq!(development.reaper.stale_after_secs, None);
}

#[test]
fn invalid_values_are_rejected() {
    let dir = TempDir::new().unwrap();
    write(&dir, "broker.toml", "[channels]\nmax_payload_size = 9000\n");

    let err = ConfigLoader::new(dir.path(), "test")
        .without_environment_variables()
        .build()
        .unwrap_err();
    assert!(matches!(err, BrokerError::Configuration { .. }));
}

#[test]
fn unsafe_table_name_is_rejected() {
    let dir = TempDir::new().unwrap();
    write(&dir, "broker.toml", "[database]\ntable_name = \"messages; DROP TABLE users\"\n");

    let err = ConfigLoader::new(dir.path(), "test")
        .without_environment_variables()
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("table_name"));
}

#[test]
fn load_file_requires_the_file() {
    let dir = TempDir::new().unwrap();
    assert!(ConfigLoader::load_file(dir.path().join("missing.toml")).is_err());

    write(&dir, "custom.toml", "[logging]\nlevel = \"debug\"\njson = true\n");
    let config = ConfigLoader::load_file(dir.path().join("custom.toml")).unwrap();
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
}
