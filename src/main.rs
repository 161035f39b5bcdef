use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use topic_gateway::{AppState, Config, IggyBroker, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration first: it carries the log filter, including one from `.env`
    let config = Config::from_env();

    // Initialize logging
    let filter = config
        .as_ref()
        .ok()
        .and_then(|config| config.log_filter().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Topic Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        log_filter = %config.log_level,
        host = %config.host,
        port = %config.port,
        broker_stream = %config.broker.stream,
        topic_prefix = %config.topic_prefix,
        auto_create_topics = config.broker.auto_create_topics,
        "Configuration loaded"
    );

    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    } else {
        info!("Metrics disabled (METRICS_PORT=0)");
    }

    // Connections are opened per request; nothing to connect up front
    let broker = IggyBroker::new(config.broker.clone());
    let state = AppState::new(broker, config.clone());
    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    if !state.check_broker().await {
        info!("Broker not reachable yet; /ready reports 503 until it is");
    }

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET  /                - Hello");
    info!("  GET  /health          - Health check");
    info!("  GET  /ready           - Readiness check");
    info!("  POST /messages/{{id}}   - Publish a message");
    info!("  GET  /messages/{{id}}   - Stream messages (?start=oldest|newest)");

    axum::serve(listener, app)
        .with_graceful_shutdown(utils::shutdown_signal(state.shutdown_token()))
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })?;

    info!("HTTP server stopped, waiting for streams to release...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
