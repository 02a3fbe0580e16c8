//! Loading client configuration documents from disk.

use std::io::Write;
use std::time::Duration;

use femtotransport::{ClientConfig, ConfigError, DeliveryMethod, HiPriOverflowPolicy, Level};
use rstest::rstest;
use tempfile::NamedTempFile;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(json.as_bytes()).expect("write config");
    file
}

#[rstest]
fn loads_full_document() {
    let file = write_config(
        r#"{
            "enabled": true,
            "appName": "orders",
            "level": 1,
            "endpoint": "tls://logs.internal:6514",
            "numberOfConnections": 4,
            "numberOfHiPriConnections": 2,
            "numberOfBackupConnections": 1,
            "numberOfHiPriBackupConnections": 1,
            "connectionResetInterval": 60000,
            "channelSize": 2048,
            "overflowChannelSize": 512,
            "overflowChannelLoggingLevel": 0,
            "hipriLoggingLevel": 0,
            "hipriChannelSize": 128,
            "hipriOverflowPolicy": "timeout:250",
            "targetMessageBatchSize": 32,
            "sendBatchLogsInterval": 250,
            "commonLabels": {"service": "orders", "zone": "b"},
            "deliveryMethod": 0,
            "healthCheckInterval": 5000,
            "healthCheckFailureThreshold": 4,
            "connectionShutdownTimout": 3000
        }"#,
    );
    let config = ClientConfig::from_path(file.path()).expect("valid config");
    assert_eq!(config.app_name, "orders");
    assert_eq!(config.level, Level::Warn);
    assert_eq!(config.total_connections(), 8);
    assert_eq!(config.connection_reset_interval, Duration::from_secs(60));
    assert_eq!(config.overflow_channel_logging_level, Level::Error);
    assert_eq!(
        config.hipri_overflow_policy,
        HiPriOverflowPolicy::Timeout(Duration::from_millis(250))
    );
    assert_eq!(config.delivery_method, DeliveryMethod::ClientSpecified);
    assert_eq!(config.common_labels.len(), 2);
    assert_eq!(config.health_check_failure_threshold, 4);
    assert_eq!(config.connection_shutdown_timeout, Duration::from_secs(3));
}

#[rstest]
fn missing_fields_take_defaults() {
    let file = write_config(r#"{"appName": "tiny"}"#);
    let config = ClientConfig::from_path(file.path()).unwrap();
    let defaults = ClientConfig::default();
    assert_eq!(config.channel_size, defaults.channel_size);
    assert_eq!(config.health_check_interval, defaults.health_check_interval);
    assert_eq!(config.delivery_method, DeliveryMethod::RoundRobin);
}

#[rstest]
#[case(r#"{"channelSize": 0}"#)]
#[case(r#"{"numberOfHiPriConnections": 0}"#)]
#[case(r#"{"healthCheckFailureThreshold": 0}"#)]
#[case(r#"{"hipriOverflowPolicy": "sometimes"}"#)]
#[case(r#"{"deliveryMethod": 7}"#)]
#[case("not json")]
fn invalid_documents_are_rejected(#[case] json: &str) {
    let file = write_config(json);
    assert!(ClientConfig::from_path(file.path()).is_err());
}

#[rstest]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ClientConfig::from_path(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
