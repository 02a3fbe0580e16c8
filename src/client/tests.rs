use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::level::Level;
use crate::test_utils::RecordingConnector;

const WAIT: Duration = Duration::from_secs(2);

fn config() -> ClientConfig {
    ClientConfig {
        app_name: "client-tests".into(),
        level: Level::Info,
        target_message_batch_size: 4,
        send_batch_logs_interval: Duration::from_millis(20),
        health_check_interval: Duration::from_secs(60),
        correlation_idle_window: Duration::from_millis(50),
        correlation_sweep_interval: Duration::from_millis(10),
        connection_shutdown_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

fn client(config: ClientConfig) -> (TransportClient, RecordingConnector) {
    let connector = RecordingConnector::new();
    let client = TransportClient::new(config, Arc::new(connector.clone())).expect("valid config");
    (client, connector)
}

#[test]
fn invalid_config_is_rejected() {
    let err = TransportClient::new(
        ClientConfig {
            channel_size: 0,
            ..config()
        },
        Arc::new(RecordingConnector::new()),
    )
    .unwrap_err();
    assert!(err.to_string().contains("channelSize"));
}

#[test]
fn disabled_client_opens_nothing() {
    let (client, connector) = client(ClientConfig {
        enabled: false,
        ..config()
    });
    assert!(!client.is_enabled());
    assert_eq!(client.try_emit(LogRecord::new(Level::Error, "x")).unwrap(), None);
    assert_eq!(connector.opened(), 0);
    assert!(client.connection_status().is_empty());
}

#[rstest]
#[case(Level::Debug, None)]
#[case(Level::Info, Some(Lane::Normal))]
#[case(Level::Error, Some(Lane::HiPri))]
fn records_are_filtered_and_classified(#[case] level: Level, #[case] lane: Option<Lane>) {
    let (client, _connector) = client(config());
    assert_eq!(client.try_emit(LogRecord::new(level, "m")).unwrap(), lane);
}

#[test]
fn audit_records_bypass_the_level_filter() {
    let (client, _connector) = client(config());
    let lane = client.try_emit(LogRecord::audit(Level::Debug, "who")).unwrap();
    assert_eq!(lane, Some(Lane::HiPri));
}

#[test]
fn partial_batch_is_sent_after_interval() {
    let (client, connector) = client(config());
    client.emit(LogRecord::new(Level::Info, "alone"));
    assert!(connector.wait_for(WAIT, |c| c.messages() == ["alone"]));
}

#[test]
fn correlated_records_travel_as_one_group() {
    let (client, connector) = client(config());
    assert!(client.open_correlation(CorrelationData::new("req-1", "checkout")));
    for step in ["start", "charge", "done"] {
        client.emit(LogRecord::new(Level::Info, step).with_correlation_id("req-1"));
    }
    assert_eq!(client.close_correlation("req-1").unwrap(), Some(Lane::Normal));
    assert!(connector.wait_for(WAIT, |c| !c.logs().is_empty()));
    let logs = connector.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].messages, ["start", "charge", "done"]);
    assert_eq!(logs[0].correlation_id.as_deref(), Some("req-1"));
}

#[test]
fn idle_correlation_is_swept() {
    let (client, connector) = client(config());
    client.emit(LogRecord::new(Level::Info, "orphan").with_correlation_id("req-2"));
    assert!(connector.wait_for(WAIT, |c| c.messages() == ["orphan"]));
}

#[test]
fn shutdown_flushes_and_rejects_later_records() {
    let (client, connector) = client(ClientConfig {
        send_batch_logs_interval: Duration::from_secs(30),
        ..config()
    });
    client.emit(LogRecord::new(Level::Info, "a"));
    client.emit(LogRecord::new(Level::Info, "b"));
    client.emit(LogRecord::new(Level::Info, "held").with_correlation_id("open"));
    client.shutdown();

    let mut messages = connector.messages();
    messages.sort();
    assert_eq!(messages, ["a", "b", "held"]);
    assert!(matches!(
        client.try_emit(LogRecord::new(Level::Info, "late")),
        Err(TransportError::Closed)
    ));
    assert!(!client.open_correlation(CorrelationData::new("x", "y")));
    assert_eq!(client.stats().dropped_closed, 1);
    assert!(client.connection_status().iter().all(|s| !s.state.is_selectable()));
    client.shutdown();
}

#[test]
fn slow_transport_is_abandoned_at_the_shutdown_deadline() {
    let (client, connector) = client(ClientConfig {
        connection_shutdown_timeout: Duration::from_millis(100),
        send_timeout: Duration::from_millis(200),
        send_batch_logs_interval: Duration::from_secs(30),
        target_message_batch_size: 64,
        ..config()
    });
    connector.set_send_delay(Duration::from_millis(60));
    for i in 0..10 {
        client.emit(LogRecord::new(Level::Info, &i.to_string()));
    }
    let started = Instant::now();
    client.shutdown();
    assert!(started.elapsed() < Duration::from_secs(1));
    let stats = client.stats();
    assert!(stats.dropped_on_shutdown > 0);
    assert_eq!(stats.sent + stats.dropped_on_shutdown, 10);
}

#[test]
fn correlated_records_racing_shutdown_are_sent_or_counted() {
    for round in 0..20 {
        let (client, connector) = client(ClientConfig {
            send_batch_logs_interval: Duration::from_secs(30),
            correlation_idle_window: Duration::from_secs(30),
            ..config()
        });
        let (accepted, refused) = std::thread::scope(|scope| {
            let producers: Vec<_> = (0..4)
                .map(|t| {
                    let client = &client;
                    scope.spawn(move || {
                        let (mut ok, mut err) = (0u64, 0u64);
                        for i in 0..200 {
                            let id = format!("{round}-{t}-{i}");
                            let record = LogRecord::new(Level::Info, &id).with_correlation_id(&id);
                            match client.try_emit(record) {
                                Ok(_) => ok += 1,
                                Err(_) => err += 1,
                            }
                        }
                        (ok, err)
                    })
                })
                .collect();
            std::thread::sleep(Duration::from_micros(200 * round));
            client.shutdown();
            producers
                .into_iter()
                .map(|p| p.join().expect("producer panicked"))
                .fold((0, 0), |(a, r), (ok, err)| (a + ok, r + err))
        });

        let stats = client.stats();
        assert_eq!(accepted + refused, 800);
        assert_eq!(refused, stats.dropped_closed, "round {round}");
        assert_eq!(
            connector.messages().len() as u64 + stats.records_dropped,
            800,
            "round {round}"
        );
    }
}
