use std::fs;
use std::io::Write;
use std::time::Duration;

use ms_server::config::ServerConfig;
use ms_server::logging::LogContext;
use ms_server::Error;
use tempfile::{tempdir, NamedTempFile};

#[test]
fn loads_a_complete_file() {
    let dir = tempdir().unwrap();
    let access = dir.path().join("access.log");

    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
listen_ip = "127.0.0.1"
listen_port = 9090
workers = 4
capacity = 2048
buffer_size = 8192
read_timeout_ms = 30000
access_log = "{}"
metrics_port = 9500
"#,
        access.display()
    )
    .unwrap();

    let config = ServerConfig::load(file.path()).unwrap();
    assert_eq!(config.listen_addr(), "127.0.0.1:9090".parse().unwrap());
    assert_eq!(config.workers, 4);
    assert_eq!(config.reactor_config().capacity, 2048);
    assert_eq!(config.reactor_config().payload_size, 16384);
    assert_eq!(config.connection_settings().read_timeout_ms, 30000);
    assert_eq!(config.max_wait(), Some(Duration::from_millis(1000)));
    assert_eq!(config.metrics_port, Some(9500));
    assert_eq!(config.access_log.as_deref(), Some(access.as_path()));
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempdir().unwrap();
    let err = ServerConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn malformed_file_is_a_parse_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "listen_port = \"eighty\"").unwrap();
    assert!(matches!(
        ServerConfig::load(file.path()),
        Err(Error::ConfigParse(_))
    ));
}

#[test]
fn access_log_follows_the_configured_path() {
    let dir = tempdir().unwrap();
    let config = ServerConfig {
        access_log: Some(dir.path().join("access.log")),
        error_log: Some(dir.path().join("error.log")),
        ..ServerConfig::default()
    };

    let logs = LogContext::open(&config).unwrap();
    logs.access_log().record(
        Some("10.0.0.1:5000".parse().unwrap()),
        18,
        56,
        b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
    );

    let written = fs::read_to_string(dir.path().join("access.log")).unwrap();
    assert!(written.ends_with(" 10.0.0.1:5000 18 56 \"GET / HTTP/1.1\"\n"));
    assert!(dir.path().join("error.log").exists());
}
