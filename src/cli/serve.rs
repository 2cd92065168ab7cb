//! Serve command implementation.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::api::{create_router, AppState};
use crate::cli::ServeArgs;
use crate::config::SollolConfig;
use crate::dispatch::Dispatcher;
use crate::health::HealthProber;
use crate::metrics::MetricsRecorder;
use crate::queue::RequestQueue;
use crate::registry::Registry;
use crate::routing::{DefaultScorer, ScoringParams};
use crate::worker::WorkerPool;

/// Load configuration with CLI overrides
pub fn load_config_with_overrides(
    args: &ServeArgs,
) -> Result<SollolConfig, Box<dyn std::error::Error>> {
    // Load from file if it exists, otherwise use defaults
    let mut config = if args.config.exists() {
        SollolConfig::load(Some(&args.config))?
    } else {
        tracing::debug!("Config file not found, using defaults");
        SollolConfig::default()
    };

    // Apply environment variable overrides
    config = config.with_env_overrides();

    // Apply CLI overrides (highest priority)
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ref host) = args.host {
        config.server.host = host.clone();
    }
    if let Some(ref log_level) = args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.no_health_check {
        config.health.enabled = false;
    }

    Ok(config)
}

/// Assemble the routing engine from configuration.
pub fn build_state(config: &SollolConfig) -> Result<Arc<AppState>, Box<dyn std::error::Error>> {
    let registry = Arc::new(Registry::new(config.exclusion.clone(), &config.metrics));
    for entry in &config.backends {
        registry.add_backend(entry)?;
        tracing::info!(
            host = %entry.host,
            port = entry.port,
            has_gpu = entry.has_gpu,
            tier = entry.tier,
            "Registered backend from config"
        );
    }

    let recorder = Arc::new(MetricsRecorder::new(
        Arc::clone(&registry),
        config.metrics.clone(),
    ));
    let queue = Arc::new(RequestQueue::new(config.queue.clone()));
    let pool = Arc::new(WorkerPool::new(&config.dispatch));

    Ok(Arc::new(AppState::new(
        registry,
        recorder,
        queue,
        pool,
        Arc::new(config.clone()),
    )))
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    cancel.cancel();
}

/// Main serve command handler
pub async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config_with_overrides(&args)?;
    config.validate()?;

    crate::logging::init_tracing(&config.logging)?;

    tracing::info!("Starting SOLLOL gateway");
    tracing::debug!(?config, "Loaded configuration");

    let state = build_state(&config)?;
    let cancel = CancellationToken::new();

    // Dispatcher loop
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
    let dispatcher_handle = dispatcher.start(cancel.clone());

    // Health prober
    let prober_handle = if config.health.enabled {
        tracing::info!("Starting health prober");
        let prober = HealthProber::new(
            Arc::clone(&state.registry),
            Arc::clone(&state.pool),
            config.health.clone(),
        );
        Some(prober.start(cancel.clone()))
    } else {
        tracing::info!("Health probing disabled");
        None
    };

    // Bind and serve
    let app = create_router(Arc::clone(&state));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %addr, "SOLLOL gateway listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // The server stopped admitting requests; let the dispatcher drain
    cancel.cancel();

    tracing::info!("Waiting for dispatcher to stop");
    dispatcher_handle.await?;

    if let Some(handle) = prober_handle {
        tracing::info!("Waiting for health prober to stop");
        handle.await?;
    }

    tracing::info!("SOLLOL gateway stopped");
    Ok(())
}
