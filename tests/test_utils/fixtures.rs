//! Fixtures building a [`TransportClient`] over an in-memory connector so
//! that pipeline tests can observe every package without opening sockets.

use std::sync::Arc;
use std::time::Duration;

use femtotransport::test_utils::RecordingConnector;
use femtotransport::{ClientConfig, Level, TransportClient};
use rstest::fixture;

/// Upper bound for polling assertions.
pub const WAIT: Duration = Duration::from_secs(3);

/// Small pools and short intervals so tests finish quickly.
pub fn base_config() -> ClientConfig {
    ClientConfig {
        app_name: "pipeline".into(),
        level: Level::Debug,
        number_of_connections: 2,
        number_of_hipri_connections: 1,
        number_of_backup_connections: 1,
        number_of_hipri_backup_connections: 1,
        target_message_batch_size: 8,
        send_batch_logs_interval: Duration::from_millis(20),
        health_check_interval: Duration::from_secs(60),
        health_check_failure_threshold: 2,
        correlation_idle_window: Duration::from_millis(100),
        correlation_sweep_interval: Duration::from_millis(10),
        connection_shutdown_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

/// Start a client for `config` over `connector`.
pub fn client_with(config: ClientConfig, connector: &RecordingConnector) -> TransportClient {
    TransportClient::new(config, Arc::new(connector.clone())).expect("valid config")
}

/// Return a running client and the connector recording its traffic.
#[fixture]
pub fn recording_client() -> (TransportClient, RecordingConnector) {
    let connector = RecordingConnector::new();
    let client = client_with(base_config(), &connector);
    (client, connector)
}
