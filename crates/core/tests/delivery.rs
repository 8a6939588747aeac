//! End-to-end delivery against a local HTTP backend.
//!
//! Each test runs a real `reqwest` transport against an `httptest` server and
//! keeps overflow storage in a temporary directory.

use std::{sync::Arc, time::Duration};

use httptest::{all_of, cycle, matchers::*, responders::*, Expectation, Server};
use parking_lot::Mutex;
use telemetry_channel::{
    config::ChannelConfig,
    diagnostics::{DiagnosticEvent, DiagnosticsSink, TracingDiagnostics},
    platform::ManualNetworkStatus,
    TelemetryChannel, TelemetryItem, TelemetryKind,
};
use testresult::TestResult;

const TRACK_PATH: &str = "/v2/track";

/// Records send outcomes and forwards everything to tracing.
#[derive(Default)]
struct Outcomes(Mutex<Vec<u16>>);

impl Outcomes {
    fn statuses(&self) -> Vec<u16> {
        self.0.lock().clone()
    }
}

impl DiagnosticsSink for Outcomes {
    fn report(&self, event: DiagnosticEvent) {
        if let DiagnosticEvent::TransmissionSent { status, .. } = &event {
            self.0.lock().push(*status);
        }
        TracingDiagnostics.report(event);
    }
}

fn config(server: &Server, folder: &std::path::Path) -> ChannelConfig {
    ChannelConfig {
        endpoint: server.url_str(TRACK_PATH),
        storage_folder: Some(folder.to_path_buf()),
        max_telemetry_buffer_capacity: 2,
        request_timeout_ms: 5_000,
        ..Default::default()
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> TestResult {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
#[test_log::test]
async fn full_batch_is_posted_as_json_lines() -> TestResult {
    let mut server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", TRACK_PATH),
            request::body(matches("\"name\":\"first\"[^\n]*\n[^\n]*\"name\":\"second\"")),
        ])
        .respond_with(status_code(200)),
    );
    let dir = tempfile::tempdir()?;
    let outcomes = Arc::new(Outcomes::default());
    let channel = TelemetryChannel::builder(config(&server, dir.path()))
        .diagnostics(outcomes.clone())
        .build()?;

    channel.send(TelemetryItem::new(TelemetryKind::Request, "first"));
    channel.send(TelemetryItem::new(TelemetryKind::Request, "second"));

    eventually(|| outcomes.statuses() == vec![200]).await?;
    server.verify_and_clear();
    Ok(())
}

#[tokio::test]
#[test_log::test]
async fn partial_success_resends_only_rejected_items() -> TestResult {
    let mut server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", TRACK_PATH),
            request::body(matches("\n")),
        ])
        .respond_with(status_code(206).body(
            r#"{"itemsReceived":2,"itemsAccepted":1,"errors":[{"index":1,"statusCode":500,"message":"internal"}]}"#,
        )),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", TRACK_PATH),
            request::body(matches("^[^\n]*\"name\":\"rejected\"[^\n]*$")),
        ])
        .respond_with(status_code(200)),
    );
    let dir = tempfile::tempdir()?;
    let outcomes = Arc::new(Outcomes::default());
    let channel = TelemetryChannel::builder(config(&server, dir.path()))
        .diagnostics(outcomes.clone())
        .build()?;

    channel.send(TelemetryItem::new(TelemetryKind::Event, "accepted"));
    channel.send(TelemetryItem::new(TelemetryKind::Event, "rejected"));

    eventually(|| outcomes.statuses() == vec![206, 200]).await?;
    server.verify_and_clear();
    Ok(())
}

#[tokio::test]
#[test_log::test]
async fn throttled_batch_is_retried_after_retry_after() -> TestResult {
    let mut server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", TRACK_PATH))
            .times(2)
            .respond_with(cycle![
                status_code(429).insert_header("Retry-After", "1"),
                status_code(200),
            ]),
    );
    let dir = tempfile::tempdir()?;
    let outcomes = Arc::new(Outcomes::default());
    let channel = TelemetryChannel::builder(config(&server, dir.path()))
        .diagnostics(outcomes.clone())
        .build()?;

    channel.send(TelemetryItem::new(TelemetryKind::Trace, "throttled"));
    channel.flush().await;

    eventually(|| outcomes.statuses() == vec![429, 200]).await?;
    server.verify_and_clear();
    Ok(())
}

#[tokio::test]
#[test_log::test]
async fn items_persisted_at_shutdown_are_sent_by_next_channel() -> TestResult {
    let mut server = Server::run();
    let dir = tempfile::tempdir()?;

    {
        let offline = TelemetryChannel::builder(config(&server, dir.path()))
            .network_status(Arc::new(ManualNetworkStatus::new(false)))
            .build()?;
        offline.send(TelemetryItem::new(TelemetryKind::Exception, "persisted"));
        offline.shutdown().await;
        assert!(offline.transmitter().storage().size() > 0);
    }
    let stored = std::fs::read_dir(dir.path())?.count();
    assert_eq!(stored, 1);

    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", TRACK_PATH),
            request::body(matches("\"name\":\"persisted\"")),
        ])
        .respond_with(status_code(200)),
    );
    let outcomes = Arc::new(Outcomes::default());
    let online = TelemetryChannel::builder(config(&server, dir.path()))
        .diagnostics(outcomes.clone())
        .build()?;

    eventually(|| outcomes.statuses() == vec![200]).await?;
    assert_eq!(online.transmitter().storage().size(), 0);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    server.verify_and_clear();
    Ok(())
}

#[tokio::test]
#[test_log::test]
async fn config_file_round_trip() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("channel.toml");
    std::fs::write(
        &path,
        r#"
        endpoint = "http://127.0.0.1:9/v2/track"
        max-telemetry-buffer-capacity = 10
        max-backlog-size = 20

        [adaptive-sampling]
        max-telemetry-items-per-second = 1.0
        "#,
    )?;
    let config = ChannelConfig::load(&path)?;
    assert_eq!(config.max_backlog_size, 20);

    let channel = TelemetryChannel::new(ChannelConfig {
        storage_folder: Some(dir.path().join("transmissions")),
        ..config
    })?;
    assert_eq!(channel.buffer().capacity(), 10);
    assert_eq!(channel.buffer().backlog_size(), 20);
    assert!(channel.sampling_estimator().is_some());
    Ok(())
}
