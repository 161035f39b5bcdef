//! Broker client facade.
//!
//! The gateway talks to the log broker through three small traits:
//!
//! ```text
//! ┌──────────────┐ connect(identity) ┌──────────────────┐ open_cursor() ┌──────────┐
//! │    Broker    │ ────────────────▶ │ BrokerConnection │ ────────────▶ │  Cursor  │
//! │ (identities) │                   │ append / close   │               │ next     │
//! └──────────────┘                   └──────────────────┘               │ close    │
//!                                                                       └──────────┘
//! ```
//!
//! Every publish and every stream gets its own connection with its own
//! [`ClientIdentity`]; nothing here is pooled or shared between requests.
//!
//! # Implementations
//!
//! - [`IggyBroker`] - Apache Iggy over TCP/QUIC, used in production
//! - [`MemoryBroker`] - in-process log used by tests and local demos
//!
//! # Closing
//!
//! Cursors expose a [`CloseSignal`]. Closing is idempotent and may race with an
//! in-flight [`Cursor::next`], which then returns `Ok(None)` within the
//! cursor's bounded wait.

mod helpers;
mod identity;
mod iggy_broker;
pub mod memory;
mod params;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{AppError, AppResult};

use helpers::to_identifier;
pub use identity::{ClientIdentity, IdentityGenerator};
pub use iggy_broker::{IggyBroker, IggyConnection, IggyCursor};
pub use memory::MemoryBroker;
pub use params::{CursorParams, DEFAULT_BATCH_SIZE, DEFAULT_MAX_WAIT};

/// Where a new cursor starts reading.
///
/// Chosen once per stream; a cursor never changes position other than by
/// moving forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// The oldest offset still retained by the broker.
    #[default]
    Oldest,
    /// The current tail: only records appended after the cursor opens.
    Newest,
}

impl StartOffset {
    /// Parse the `start` query parameter of a stream request.
    ///
    /// Absent, `true` and `oldest` select [`StartOffset::Oldest`];
    /// `false` and `newest` select [`StartOffset::Newest`].
    pub fn from_query(value: Option<&str>) -> AppResult<Self> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Oldest),
            Some(v) if v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("oldest") => {
                Ok(Self::Oldest)
            }
            Some(v) if v.eq_ignore_ascii_case("false") || v.eq_ignore_ascii_case("newest") => {
                Ok(Self::Newest)
            }
            Some(other) => Err(AppError::BadRequest(format!(
                "Invalid start '{other}': expected one of oldest, newest, true, false"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oldest => "oldest",
            Self::Newest => "newest",
        }
    }
}

/// A record to append.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    pub topic: String,
    /// Routing key used by the broker to pick a partition.
    pub key: String,
    /// Record value, forwarded byte-for-byte.
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// A record read from a cursor.
#[derive(Debug, Clone)]
pub struct Record {
    pub offset: u64,
    /// Broker-assigned timestamp in microseconds since the Unix epoch.
    pub timestamp: u64,
    pub payload: Bytes,
}

/// Idempotent close flag shared between a cursor and whoever may close it.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    closed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the signal. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the signal is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// Entry point of a broker: hands out identities and opens connections.
pub trait Broker: Clone + Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Generator of unique client identities for this broker.
    fn identities(&self) -> &IdentityGenerator;

    /// Open a connection scoped to `identity`.
    ///
    /// Fails with [`AppError::BrokerUnreachable`] when no broker endpoint answers.
    fn connect(
        &self,
        identity: ClientIdentity,
    ) -> impl Future<Output = AppResult<Self::Connection>> + Send;
}

/// A client-scoped connection to the broker.
pub trait BrokerConnection: Send + Sync + 'static {
    type Cursor: Cursor;

    fn identity(&self) -> &ClientIdentity;

    /// Append one record and wait for the broker's acknowledgment.
    fn append(&self, record: &OutboundRecord) -> impl Future<Output = AppResult<()>> + Send;

    /// Open a read cursor on one partition of `topic`.
    fn open_cursor(
        &self,
        topic: &str,
        params: CursorParams,
    ) -> impl Future<Output = AppResult<Self::Cursor>> + Send;

    /// Release the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// A position-bound read handle on one topic partition.
pub trait Cursor: Send + 'static {
    /// Next record in offset order.
    ///
    /// Waits between deliveries instead of spinning. Returns `Ok(None)` once the
    /// cursor is closed or the partition has ended.
    fn next(&mut self) -> impl Future<Output = AppResult<Option<Record>>> + Send;

    /// Handle that closes this cursor from another task.
    fn close_signal(&self) -> CloseSignal;

    /// Close the cursor. Returns `true` only for the call that closed it.
    fn close(&self) -> bool {
        self.close_signal().close()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_start_offset_defaults_to_oldest() {
        assert_eq!(StartOffset::from_query(None).unwrap(), StartOffset::Oldest);
        assert_eq!(
            StartOffset::from_query(Some("")).unwrap(),
            StartOffset::Oldest
        );
        assert_eq!(StartOffset::default(), StartOffset::Oldest);
    }

    #[test]
    fn test_start_offset_accepts_booleans_and_names() {
        assert_eq!(
            StartOffset::from_query(Some("true")).unwrap(),
            StartOffset::Oldest
        );
        assert_eq!(
            StartOffset::from_query(Some("false")).unwrap(),
            StartOffset::Newest
        );
        assert_eq!(
            StartOffset::from_query(Some("Newest")).unwrap(),
            StartOffset::Newest
        );
        assert_eq!(
            StartOffset::from_query(Some("oldest")).unwrap(),
            StartOffset::Oldest
        );
    }

    #[test]
    fn test_start_offset_rejects_unknown_values() {
        let err = StartOffset::from_query(Some("middle")).unwrap_err();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("middle"));
    }

    #[test]
    fn test_close_signal_closes_once() {
        let signal = CloseSignal::new();
        let other = signal.clone();

        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!other.close());
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn test_close_signal_concurrent_close_releases_once() {
        let signal = CloseSignal::new();
        let mut handles = Vec::new();

        for _ in 0..8 {
            let signal = signal.clone();
            handles.push(tokio::spawn(async move { signal.close() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        tokio::time::timeout(std::time::Duration::from_millis(100), signal.closed())
            .await
            .expect("closed() should resolve after close");
    }
}
