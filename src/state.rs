//! Shared application state for Axum handlers.
//!
//! - **Services**: publish and stream services over one broker facade
//! - **Configuration**: runtime configuration access
//! - **Lifecycle**: task tracker and root cancellation token for stream tasks
//!
//! # Structured Concurrency
//!
//! Every stream's relay and watcher tasks are spawned on one
//! `tokio_util::task::TaskTracker`, and every stream's cancellation token is a
//! child of one root `CancellationToken`. Call `shutdown()` to cancel live
//! streams and wait until their broker resources are released.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerConnection};
use crate::config::Config;
use crate::services::{PublishService, StreamService};

/// Shared application state, cloned for each request handler.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(IggyBroker::new(config.broker.clone()), config);
/// // ... serve requests ...
/// state.shutdown().await;  // Cancel streams and wait for their release
/// ```
#[derive(Clone)]
pub struct AppState<B: Broker> {
    /// Broker facade shared by all services
    pub broker: B,
    pub publisher: PublishService<B>,
    pub streams: StreamService<B>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Application configuration
    pub config: Arc<Config>,
    /// Tracks stream tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Parent of every stream's cancellation token
    cancellation_token: CancellationToken,
}

impl<B: Broker> AppState<B> {
    pub fn new(broker: B, config: Config) -> Self {
        let task_tracker = TaskTracker::new();
        let publisher = PublishService::new(broker.clone());
        let streams = StreamService::new(
            broker.clone(),
            config.broker.clone(),
            config.relay_buffer,
            task_tracker.clone(),
        );

        Self {
            broker,
            publisher,
            streams,
            started_at: Instant::now(),
            config: Arc::new(config),
            task_tracker,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// A fresh cancellation token for one stream, cancelled on shutdown.
    pub fn stream_token(&self) -> CancellationToken {
        self.cancellation_token.child_token()
    }

    /// Root token; cancelling it ends every live stream.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Streams whose resources are still held.
    pub fn active_streams(&self) -> usize {
        self.streams.active_streams()
    }

    /// Check that a broker connection can be opened right now.
    pub async fn check_broker(&self) -> bool {
        let identity = self.broker.identities().issue("readiness");
        match self.broker.connect(identity).await {
            Ok(connection) => {
                connection.close().await;
                true
            }
            Err(e) => {
                debug!(error = %e, "Broker readiness check failed");
                false
            }
        }
    }

    /// Gracefully end all streams.
    ///
    /// 1. Cancels every stream token
    /// 2. Closes the task tracker (no new streams can start)
    /// 3. Waits until every relay and watcher task has finished
    pub async fn shutdown(&self) {
        info!(
            active_streams = self.active_streams(),
            "Initiating graceful shutdown of streams"
        );

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All stream tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
