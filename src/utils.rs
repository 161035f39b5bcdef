use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Wait for a shutdown signal (Ctrl+C or SIGTERM), then cancel `streams`.
///
/// Live streams never finish on their own, so they are cancelled as soon as
/// the signal arrives; the HTTP server can then drain its connections.
/// A signal whose handler cannot be installed is logged and never fires.
pub async fn shutdown_signal(streams: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    streams.cancel();
}
