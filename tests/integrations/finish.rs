#[path = "../helpers/mod.rs"]
mod helpers;

use ciwatch::config::Config;
use ciwatch::orchestrator::Orchestrator;
use ciwatch::reporter::SendOutcome;
use ciwatch::state::{PersistedState, StateStore};
use ciwatch::tracer::{OsRelease, TracerState, TracerSupervisor};
use helpers::daemon::TestDaemonBuilder;
use helpers::fake_listing::{workflow_job, StaticListing};
use helpers::test_ci_context;
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const STARTED_AT: i64 = 1_700_000_000_000;

fn config(state_dir: &TempDir, collector: &MockServer, api_key: Option<&str>) -> Config {
    let mut config = Config::default();
    config.state_dir = state_dir.path().to_path_buf();
    config.reporter.base_url = collector.uri();
    config.reporter.on_demand_base_url = collector.uri();
    config.reporter.api_key = api_key.map(str::to_string);
    config.identity.retry_delay_ms = 10;
    config
}

#[tokio::test]
async fn finish_reports_metrics_and_an_empty_process_payload() {
    let daemon = TestDaemonBuilder::new().start().await;
    daemon.wait_for_snapshots(4).await;
    let state_dir = TempDir::new().unwrap();
    StateStore::new(state_dir.path())
        .save(&PersistedState {
            server_port: Some(daemon.addr.port()),
            started_at: Some(STARTED_AT),
            ..PersistedState::default()
        })
        .unwrap();

    let collector = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/metrics"))
        .and(header("authorization", "ApiKey secret"))
        .and(body_partial_json(json!({
            "metaData": {
                "ciProvider": "GITHUB",
                "runId": 77,
                "repoOwner": "octo",
                "repoName": "widgets",
                "jobId": 42,
                "jobName": "job-42",
                "createdAt": STARTED_AT
            },
            "telemetryData": { "type": "Metric", "version": "v1" }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&collector)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/processes"))
        .and(body_partial_json(json!({
            "telemetryData": { "type": "Process", "version": "v1", "data": [] }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&collector)
        .await;

    let listing = Arc::new(StaticListing::new(vec![
        workflow_job(41, "completed", "runner-1"),
        workflow_job(42, "in_progress", "runner-1"),
    ]));
    let orchestrator = Orchestrator::new(config(&state_dir, &collector, Some("secret")))
        .ci_context(test_ci_context())
        .job_listing_override(listing.clone());

    let report = orchestrator.finish().await.unwrap();

    assert_eq!(report.tracer, TracerState::NotStarted);
    assert_eq!(report.process_count, 0);
    // The initial scheduled tick plus the final triggered one.
    assert_eq!(report.metric_count, 8);
    assert_eq!(report.job.id, Some(42));
    assert_eq!(report.metrics_sent, Some(SendOutcome::Sent));
    assert_eq!(report.processes_sent, Some(SendOutcome::Sent));
    assert_eq!(listing.requested_pages(), vec![0]);

    let saved = StateStore::new(state_dir.path()).load().unwrap();
    assert_eq!(saved.job_id, Some(42));
    assert_eq!(saved.job_name.as_deref(), Some("job-42"));

    daemon.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn finish_without_api_key_skips_delivery() {
    let state_dir = TempDir::new().unwrap();
    let collector = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/apikey/ondemand"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&collector)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/metrics"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&collector)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/processes"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&collector)
        .await;

    let orchestrator = Orchestrator::new(config(&state_dir, &collector, None))
        .ci_context(test_ci_context())
        .job_listing_override(Arc::new(StaticListing::new(vec![workflow_job(
            1,
            "in_progress",
            "runner-1",
        )])));

    let report = orchestrator.finish().await.unwrap();

    // No daemon port was saved, so there is nothing to fetch.
    assert_eq!(report.metric_count, 0);
    assert_eq!(report.metrics_sent, Some(SendOutcome::Skipped));
    assert_eq!(report.processes_sent, Some(SendOutcome::Skipped));
}

#[tokio::test]
async fn finish_survives_an_unreachable_daemon() {
    let state_dir = TempDir::new().unwrap();
    let unused_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    StateStore::new(state_dir.path())
        .save(&PersistedState {
            server_port: Some(unused_port),
            ..PersistedState::default()
        })
        .unwrap();

    let collector = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/metrics"))
        .and(body_partial_json(json!({ "telemetryData": { "data": [] } })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&collector)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/processes"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&collector)
        .await;

    let orchestrator = Orchestrator::new(config(&state_dir, &collector, Some("secret")))
        .ci_context(test_ci_context())
        .job_listing_override(Arc::new(StaticListing::new(Vec::new())));

    let report = orchestrator.finish().await.unwrap();

    assert_eq!(report.metric_count, 0);
    assert_eq!(report.job.id, None);
    assert_eq!(report.metrics_sent, Some(SendOutcome::Sent));
    assert_eq!(report.processes_sent, Some(SendOutcome::Failed));
}

#[tokio::test]
async fn start_saves_port_and_launches_the_daemon() {
    let state_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.state_dir = state_dir.path().to_path_buf();
    config.tracer.enabled = false;

    let report = Orchestrator::new(config)
        // Stands in for `ciwatch daemon`; it ignores its arguments.
        .daemon_exe(PathBuf::from("true"))
        .start()
        .await
        .unwrap();

    assert!(report.port >= 10000);
    assert!(report.daemon_pid.is_some());
    assert_eq!(report.tracer, TracerState::NotStarted);

    let saved = StateStore::new(state_dir.path()).load().unwrap();
    assert_eq!(saved.server_port, Some(report.port));
    assert_eq!(saved.daemon_pid, report.daemon_pid);
    let started_at = saved.started_at.unwrap();
    assert_eq!(started_at % 1000, 0);
    assert!(state_dir.path().join("daemon.log").exists());
}

#[tokio::test]
async fn finish_waits_for_the_tracer_to_flush_before_ingesting() {
    let state_dir = TempDir::new().unwrap();
    let bin_dir = TempDir::new().unwrap();
    // Arguments are `-f json -o <output>`; the record lands 300 ms after SIGINT.
    let tracer_path = bin_dir.path().join("proc_tracer_ubuntu-22");
    std::fs::write(
        &tracer_path,
        r#"#!/bin/sh
out="$4"
trap 'sleep 0.3; printf "%s\n" "{\"ts\":\"t\",\"event\":\"EXIT\",\"name\":\"make\",\"uid\":1000,\"pid\":10,\"ppid\":\"1\",\"startTime\":1,\"fileName\":\"/usr/bin/make\",\"args\":[\"make\"],\"duration\":900,\"exitCode\":0}" > "$out"; exit 0' INT
while :; do sleep 0.05; done
"#,
    )
    .unwrap();
    std::fs::set_permissions(&tracer_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let collector = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/metrics"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&collector)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/telemetry/processes"))
        .and(body_partial_json(json!({
            "telemetryData": { "type": "Process", "data": [{ "name": "make" }] }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&collector)
        .await;

    let mut config = config(&state_dir, &collector, Some("secret"));
    config.tracer.binary_dir = bin_dir.path().to_path_buf();
    config.tracer.use_sudo = false;
    config.tracer.startup_grace_ms = 200;
    let ubuntu = OsRelease::new("Ubuntu", "22.04");

    let started = TracerSupervisor::new(config.tracer.clone(), state_dir.path())
        .with_os_release(Some(ubuntu.clone()))
        .start()
        .await;
    assert!(matches!(started, TracerState::Running { .. }));

    let report = Orchestrator::new(config)
        .ci_context(test_ci_context())
        .os_release_override(Some(ubuntu))
        .job_listing_override(Arc::new(StaticListing::new(vec![workflow_job(
            5,
            "in_progress",
            "runner-1",
        )])))
        .finish()
        .await
        .unwrap();

    assert_eq!(report.tracer, TracerState::Stopped);
    assert_eq!(report.process_count, 1);
    assert_eq!(report.processes_sent, Some(SendOutcome::Sent));
}
