//! Shared test harness: a full gateway (registry, queue, dispatcher,
//! worker pool) bound to an ephemeral port, fronting wiremock backends.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use sollol::api::{create_router, AppState};
use sollol::cli::serve::build_state;
use sollol::config::{BackendEntry, SollolConfig};
use sollol::dispatch::Dispatcher;
use sollol::routing::{DefaultScorer, ScoringParams};

pub struct TestGateway {
    pub base_url: String,
    pub state: Arc<AppState>,
    pub client: reqwest::Client,
    cancel: CancellationToken,
}

impl TestGateway {
    /// Build and start a gateway from the given config. Backends are
    /// marked alive immediately (the background prober is not started;
    /// tests drive probe state through the registry directly).
    pub async fn start(config: SollolConfig) -> Self {
        let state = build_state(&config).expect("state builds");

        // Backends start non-alive until probed
        for id in state.registry.ids() {
            state
                .registry
                .update_probe(&id, true, Some(5.0), None, None)
                .unwrap();
        }

        let scorer = Arc::new(DefaultScorer::new(
            ScoringParams {
                per_backend_concurrency: config.dispatch.per_backend_concurrency,
                ..ScoringParams::default()
            },
            Arc::clone(&state.recorder),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&state.registry),
            Arc::clone(&state.recorder),
            scorer,
            Arc::clone(&state.queue),
            Arc::clone(&state.pool),
            config.dispatch.clone(),
            Duration::from_millis(config.queue.age_boost_step_ms),
        ));

        let cancel = CancellationToken::new();
        dispatcher.start(cancel.clone());

        let app = create_router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            client: reqwest::Client::new(),
            cancel,
        }
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&body)
            .send()
            .await
            .expect("gateway reachable")
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Backend entry pointing at a wiremock server.
pub fn entry_for(uri: &str, has_gpu: bool) -> BackendEntry {
    let stripped = uri.strip_prefix("http://").expect("http uri");
    let (host, port) = stripped.split_once(':').expect("host:port");
    BackendEntry {
        host: host.to_string(),
        port: port.parse().expect("numeric port"),
        has_gpu,
        gpu_memory_total_mb: if has_gpu { 16384 } else { 0 },
        ..Default::default()
    }
}

/// A minimal Ollama chat response body.
pub fn chat_response(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "message": {"role": "assistant", "content": "hello from upstream"},
        "done": true
    })
}

/// A minimal Ollama generate response body.
pub fn generate_response(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "response": "generated text",
        "done": true
    })
}

/// Identity string "host:port" for a wiremock server.
pub fn backend_key(uri: &str) -> String {
    uri.strip_prefix("http://").unwrap().to_string()
}
