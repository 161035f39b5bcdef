//! # Topic Gateway
//!
//! An HTTP gateway in front of a partitioned, append-only log broker:
//!
//! - **Publish**: `POST /messages/{id}` validates a JSON message and appends
//!   the received bytes, unchanged, to topic `messages-{id}`
//! - **Stream**: `GET /messages/{id}` relays the topic to the client as
//!   newline-delimited JSON, from the oldest or the newest offset, until the
//!   client disconnects
//! - **Lifecycle**: each stream's broker connection and cursor are released
//!   exactly once, whichever side ends the stream first
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → CORS → Body limit)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, messages)                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services (PublishService, StreamService + lifecycle)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Broker facade (Broker / BrokerConnection / Cursor)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IggyBroker (Apache Iggy)      │  MemoryBroker (in-process) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use topic_gateway::{AppState, Config, IggyBroker, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let broker = IggyBroker::new(config.broker.clone());
//!
//!     let state = AppState::new(broker, config);
//!     let app = build_router(state.clone());
//!
//!     // Serve `app`, then:
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use broker::{IggyBroker, MemoryBroker, StartOffset};
pub use config::{BrokerConfig, Config};
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
