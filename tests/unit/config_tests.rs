use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use prefork_server::config::PORT_ENV;
use prefork_server::{AppError, ServerConfig};

fn full_toml() -> &'static str {
    r#"
host = "127.0.0.1"
port = 9000
workers = 4
timeout_seconds = 10
graceful_timeout_seconds = 5
boot_timeout_seconds = 3
monitor_interval_ms = 250
max_body_bytes = 1024
app = "echo"
"#
}

#[test]
fn defaults_match_documented_values() {
    let config = ServerConfig::default();
    assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    assert_eq!(config.port, 8080);
    assert_eq!(config.workers, 2);
    assert_eq!(config.timeout(), Duration::from_secs(300));
    assert_eq!(config.graceful_timeout(), Duration::from_secs(30));
    assert_eq!(config.boot_timeout(), Duration::from_secs(30));
    assert_eq!(config.monitor_interval(), Duration::from_secs(1));
    assert_eq!(config.max_body_bytes, 16 * 1024 * 1024);
    assert_eq!(config.app, "hello");
    config.validate().expect("defaults are valid");
}

#[test]
fn parses_every_key() {
    let config = ServerConfig::from_toml_str(full_toml()).expect("config parses");
    assert_eq!(
        config.bind_addr(),
        SocketAddr::from((Ipv4Addr::LOCALHOST, 9000))
    );
    assert_eq!(config.worker_count(), 4);
    assert_eq!(config.timeout(), Duration::from_secs(10));
    assert_eq!(config.graceful_timeout(), Duration::from_secs(5));
    assert_eq!(config.boot_timeout(), Duration::from_secs(3));
    assert_eq!(config.monitor_interval(), Duration::from_millis(250));
    assert_eq!(config.max_body_bytes, 1024);
    assert_eq!(config.app, "echo");
}

#[test]
fn empty_file_yields_defaults() {
    let config = ServerConfig::from_toml_str("").expect("empty config parses");
    assert_eq!(config, ServerConfig::default());
}

#[test]
fn unknown_key_is_rejected() {
    let err = ServerConfig::from_toml_str("wrokers = 3").expect_err("typo must fail");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[test]
fn zero_workers_is_rejected() {
    let err = ServerConfig::from_toml_str("workers = 0").expect_err("zero workers");
    assert!(err.to_string().contains("workers"), "got {err}");
}

#[test]
fn zero_timeout_is_rejected() {
    let err = ServerConfig::from_toml_str("timeout_seconds = 0").expect_err("zero timeout");
    assert!(err.to_string().contains("timeout_seconds"), "got {err}");
}

#[test]
fn unknown_app_lists_available_apps() {
    let err = ServerConfig::from_toml_str(r#"app = "main:app""#).expect_err("unknown app");
    let message = err.to_string();
    assert!(message.contains("main:app"), "got {message}");
    assert!(message.contains("hello"), "got {message}");
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.toml");
    std::fs::write(&path, full_toml()).expect("write config");

    let config = ServerConfig::load_from_path(&path).expect("config loads");
    assert_eq!(config.port, 9000);
}

#[test]
fn load_from_missing_path_is_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = ServerConfig::load_from_path(dir.path().join("absent.toml"))
        .expect_err("missing file");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
}

#[test]
#[serial_test::serial]
fn port_env_overrides_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "port = 9000").expect("write config");

    std::env::set_var(PORT_ENV, "9100");
    let loaded = ServerConfig::load(Some(&path));
    std::env::remove_var(PORT_ENV);

    assert_eq!(loaded.expect("config loads").port, 9100);
}

#[test]
#[serial_test::serial]
fn port_env_absent_keeps_default() {
    std::env::remove_var(PORT_ENV);
    let config = ServerConfig::load(None).expect("defaults load");
    assert_eq!(config.port, 8080);
}

#[test]
#[serial_test::serial]
fn blank_port_env_is_ignored() {
    std::env::set_var(PORT_ENV, "  ");
    let loaded = ServerConfig::load(None);
    std::env::remove_var(PORT_ENV);

    assert_eq!(loaded.expect("config loads").port, 8080);
}

#[test]
#[serial_test::serial]
fn invalid_port_env_is_config_error() {
    std::env::set_var(PORT_ENV, "eighty");
    let loaded = ServerConfig::load(None);
    std::env::remove_var(PORT_ENV);

    let err = loaded.expect_err("invalid PORT");
    assert!(matches!(err, AppError::Config(_)), "got {err}");
    assert!(err.to_string().contains("PORT"), "got {err}");
}

#[test]
fn set_bind_addr_replaces_host_and_port() {
    let mut config = ServerConfig::default();
    config.set_bind_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
    assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(config.port, 0);
}
