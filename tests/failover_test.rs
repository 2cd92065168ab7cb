//! Failover and exclusion scenarios.

mod common;

use common::{backend_key, entry_for, generate_response, TestGateway};
use serde_json::json;
use sollol::config::SollolConfig;
use sollol::registry::BackendId;
use std::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Start one failing and one healthy backend; the failing one is the
/// first scoring tie-break (lower port) so attempts hit it first while
/// both are fresh.
async fn failing_and_healthy(endpoint: &str) -> (MockServer, MockServer) {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    // Roles by port so fresh-state tie-breaks are deterministic
    let (failing, healthy) = if a.address().port() < b.address().port() {
        (a, b)
    } else {
        (b, a)
    };

    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&failing)
        .await;
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(generate_response("m"))
                .set_delay(std::time::Duration::from_millis(50)),
        )
        .mount(&healthy)
        .await;

    (failing, healthy)
}

fn id_of(server: &MockServer) -> BackendId {
    let key = backend_key(&server.uri());
    let (host, port) = key.split_once(':').unwrap();
    BackendId::new(host, port.parse::<u16>().unwrap())
}

#[tokio::test]
async fn failover_to_healthy_backend_on_500() {
    let (failing, healthy) = failing_and_healthy("/api/generate").await;

    let mut config = SollolConfig::default();
    config.backends.push(entry_for(&failing.uri(), false));
    config.backends.push(entry_for(&healthy.uri(), false));
    let gateway = TestGateway::start(config).await;

    let response = gateway
        .post(
            "/api/generate",
            json!({"model": "m", "prompt": "hello", "priority": 5}),
        )
        .await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["routing"]["chosen_backend"], backend_key(&healthy.uri()));

    // The failing backend appears once in diagnostics: each attempt walks
    // to a candidate not yet tried in this request's lifetime.
    let attempts = body["routing"]["failed_attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0]["backend"], backend_key(&failing.uri()));
    assert_eq!(attempts[0]["error_class"], "upstream_server_error");

    // One failure recorded, below the exclusion threshold of 3
    let snapshot = gateway
        .state
        .registry
        .snapshot_one(&id_of(&failing))
        .unwrap();
    assert_eq!(snapshot.failure_streak, 1);
    assert!(!snapshot.is_excluded(Instant::now()));
}

#[tokio::test]
async fn three_failures_exclude_backend() {
    let (failing, healthy) = failing_and_healthy("/api/generate").await;

    let mut config = SollolConfig::default();
    config.backends.push(entry_for(&failing.uri(), false));
    config.backends.push(entry_for(&healthy.uri(), false));
    let gateway = TestGateway::start(config).await;

    // Each request fails over from the failing backend, adding one to its
    // streak; the third failure opens the exclusion window.
    for _ in 0..3 {
        let response = gateway
            .post("/api/generate", json!({"model": "m", "prompt": "hello"}))
            .await;
        assert_eq!(response.status(), 200);
    }

    let snapshot = gateway
        .state
        .registry
        .snapshot_one(&id_of(&failing))
        .unwrap();
    assert!(
        snapshot.is_excluded(Instant::now()),
        "third consecutive failure must exclude"
    );

    // While excluded the backend is never attempted
    let before = failing.received_requests().await.unwrap().len();
    let response = gateway
        .post("/api/generate", json!({"model": "m", "prompt": "again"}))
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["routing"]["failed_attempts"].as_array().unwrap().len(), 0);
    assert_eq!(
        failing.received_requests().await.unwrap().len(),
        before,
        "excluded backend must receive no traffic"
    );
}

#[tokio::test]
async fn excluded_backend_reinstated_by_probe_after_window() {
    let (failing, healthy) = failing_and_healthy("/api/generate").await;

    let mut config = SollolConfig::default();
    config.backends.push(entry_for(&failing.uri(), false));
    config.backends.push(entry_for(&healthy.uri(), false));
    config.exclusion.backoff_schedule_ms = vec![50];
    let gateway = TestGateway::start(config).await;

    for _ in 0..3 {
        let _ = gateway
            .post("/api/generate", json!({"model": "m", "prompt": "x"}))
            .await;
    }
    let failing_id = id_of(&failing);
    assert!(gateway
        .state
        .registry
        .snapshot_one(&failing_id)
        .unwrap()
        .is_excluded(Instant::now()));

    // A probe inside the window does not reinstate
    gateway
        .state
        .registry
        .update_probe(&failing_id, true, Some(5.0), None, None)
        .unwrap();
    assert!(!gateway
        .state
        .registry
        .snapshot_one(&failing_id)
        .unwrap()
        .alive);

    // After the window passes, a successful probe reinstates
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    gateway
        .state
        .registry
        .update_probe(&failing_id, true, Some(5.0), None, None)
        .unwrap();
    let snapshot = gateway
        .state
        .registry
        .snapshot_one(&failing_id)
        .unwrap();
    assert!(snapshot.alive);
    assert!(snapshot.is_available(Instant::now()));
}

#[tokio::test]
async fn all_backends_failing_yields_502_with_diagnostics() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    for server in [&a, &b] {
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(server)
            .await;
    }

    let mut config = SollolConfig::default();
    config.backends.push(entry_for(&a.uri(), false));
    config.backends.push(entry_for(&b.uri(), false));
    let gateway = TestGateway::start(config).await;

    let response = gateway
        .post("/api/generate", json!({"model": "m", "prompt": "x"}))
        .await;

    assert_eq!(response.status(), 502);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "all_attempts_failed");
    let attempts = body["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2, "one diagnostic per tried backend");
}

#[tokio::test]
async fn model_missing_404_fails_over_to_other_backend() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    let (missing, serving) = if a.address().port() < b.address().port() {
        (a, b)
    } else {
        (b, a)
    };

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
        .mount(&missing)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(generate_response("m"))
                .set_delay(std::time::Duration::from_millis(30)),
        )
        .mount(&serving)
        .await;

    let mut config = SollolConfig::default();
    config.backends.push(entry_for(&missing.uri(), false));
    config.backends.push(entry_for(&serving.uri(), false));
    let gateway = TestGateway::start(config).await;

    let response = gateway
        .post("/api/generate", json!({"model": "m", "prompt": "x"}))
        .await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["routing"]["chosen_backend"], backend_key(&serving.uri()));
    let attempts = body["routing"]["failed_attempts"].as_array().unwrap();
    assert_eq!(attempts[0]["error_class"], "upstream_client_error");

    // A capability miss is not the backend's fault: no exclusion pressure
    let snapshot = gateway
        .state
        .registry
        .snapshot_one(&id_of(&missing))
        .unwrap();
    assert_eq!(snapshot.failure_streak, 0);
}
