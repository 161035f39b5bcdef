//! Stream session lifecycle.
//!
//! A stream owns a broker connection and a cursor. Two tasks may try to end
//! it: the relay (end of partition, read error, output gone) and the watcher
//! (client cancellation). Whichever gets there first claims the close; the
//! other one becomes a no-op.
//!
//! ```text
//! Init ──▶ Connected ──▶ Streaming
//!   │          │             │
//!   └──────────┴─────────────┴──▶ Closed(reason)
//! ```
//!
//! # Memory Ordering
//!
//! The whole state, including the close reason, lives in one `AtomicU8` so
//! claiming the close and recording why is a single `SeqCst` read-modify-write.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broker::{BrokerConnection, CloseSignal};
use crate::metrics;

const INIT: u8 = 0;
const CONNECTED: u8 = 1;
const STREAMING: u8 = 2;
/// Closed states are `CLOSED + reason code`.
const CLOSED: u8 = 0x10;

/// Observable phase of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Connected,
    Streaming,
    Closed,
}

/// Why a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away, or the gateway is shutting down.
    ClientCancelled,
    /// The cursor reported the end of the partition.
    EndOfStream,
    /// The cursor failed; not retried.
    ReadError,
    /// Nobody is receiving the relayed output anymore.
    OutputClosed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientCancelled => "client_cancelled",
            Self::EndOfStream => "end_of_stream",
            Self::ReadError => "read_error",
            Self::OutputClosed => "output_closed",
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::ClientCancelled => 0,
            Self::EndOfStream => 1,
            Self::ReadError => 2,
            Self::OutputClosed => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::ClientCancelled),
            1 => Some(Self::EndOfStream),
            2 => Some(Self::ReadError),
            3 => Some(Self::OutputClosed),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State machine of one stream session.
#[derive(Debug)]
pub struct SessionState {
    state: AtomicU8,
    closed: Notify,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(INIT),
            closed: Notify::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self.state.load(Ordering::SeqCst) {
            INIT => Phase::Init,
            CONNECTED => Phase::Connected,
            STREAMING => Phase::Streaming,
            _ => Phase::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    /// The reason recorded by whoever closed the session.
    pub fn close_reason(&self) -> Option<CloseReason> {
        let state = self.state.load(Ordering::SeqCst);
        if state >= CLOSED {
            CloseReason::from_code(state - CLOSED)
        } else {
            None
        }
    }

    /// Move one step forward: `Init → Connected` or `Connected → Streaming`.
    ///
    /// Returns `false` if the session is not in the preceding phase, which
    /// includes every closed session.
    pub fn advance(&self, to: Phase) -> bool {
        let (from, to) = match to {
            Phase::Connected => (INIT, CONNECTED),
            Phase::Streaming => (CONNECTED, STREAMING),
            Phase::Init | Phase::Closed => return false,
        };
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Close the session from any phase.
    ///
    /// Returns `true` only for the call that actually closed it; that call's
    /// reason is the one recorded.
    pub fn close(&self, reason: CloseReason) -> bool {
        let won = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                (state < CLOSED).then_some(CLOSED + reason.code())
            })
            .is_ok();

        if won {
            self.closed.notify_waiters();
        }
        won
    }

    /// Resolves once the session is closed.
    pub async fn wait_closed(&self) {
        // Register before checking so a close in between is not missed
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the active stream count in step with live sessions.
#[derive(Debug)]
pub(crate) struct ActiveStreamGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveStreamGuard {
    pub(crate) fn new(active: Arc<AtomicUsize>) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_streams(count);
        Self { active }
    }
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_active_streams(count);
    }
}

/// Resources of one stream, released exactly once.
pub(crate) struct StreamSession<C: BrokerConnection> {
    topic: String,
    state: Arc<SessionState>,
    connection: C,
    cursor: CloseSignal,
    _active: ActiveStreamGuard,
}

impl<C: BrokerConnection> StreamSession<C> {
    pub(crate) fn new(
        topic: String,
        state: Arc<SessionState>,
        connection: C,
        cursor: CloseSignal,
        active: ActiveStreamGuard,
    ) -> Self {
        Self {
            topic,
            state,
            connection,
            cursor,
            _active: active,
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    /// End the session, closing the cursor and then the connection.
    ///
    /// Only the first caller releases anything and has its reason recorded.
    pub(crate) async fn terminate(&self, reason: CloseReason) -> bool {
        if !self.state.close(reason) {
            debug!(topic = %self.topic, %reason, "Stream already closed");
            return false;
        }

        self.cursor.close();
        self.connection.close().await;

        info!(
            topic = %self.topic,
            client = %self.connection.identity(),
            %reason,
            "Stream closed"
        );
        metrics::record_stream_closed(reason.as_str());
        true
    }
}

/// Wait for the client to go away and tear the session down.
///
/// Returns as soon as the session is closed by any path.
pub(crate) async fn watch<C: BrokerConnection>(
    session: Arc<StreamSession<C>>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            session.terminate(CloseReason::ClientCancelled).await;
        }
        _ = session.state().wait_closed() => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::broker::{Broker, Cursor, CursorParams, MemoryBroker, StartOffset};

    #[test]
    fn test_session_state_forward_transitions() {
        let state = SessionState::new();
        assert_eq!(state.phase(), Phase::Init);

        assert!(!state.advance(Phase::Streaming));
        assert!(state.advance(Phase::Connected));
        assert!(!state.advance(Phase::Connected));
        assert!(state.advance(Phase::Streaming));
        assert_eq!(state.phase(), Phase::Streaming);
        assert!(state.close_reason().is_none());
    }

    #[test]
    fn test_closed_is_terminal() {
        let state = SessionState::new();
        assert!(state.advance(Phase::Connected));

        assert!(state.close(CloseReason::EndOfStream));
        assert!(!state.close(CloseReason::ClientCancelled));
        assert!(!state.advance(Phase::Streaming));

        assert_eq!(state.phase(), Phase::Closed);
        assert_eq!(state.close_reason(), Some(CloseReason::EndOfStream));
    }

    #[test]
    fn test_close_from_init() {
        let state = SessionState::new();
        assert!(state.close(CloseReason::ClientCancelled));
        assert_eq!(state.close_reason(), Some(CloseReason::ClientCancelled));
    }

    #[tokio::test]
    async fn test_concurrent_close_has_single_winner() {
        let state = Arc::new(SessionState::new());
        let reasons = [
            CloseReason::ClientCancelled,
            CloseReason::EndOfStream,
            CloseReason::ReadError,
            CloseReason::OutputClosed,
        ];

        let handles: Vec<_> = reasons
            .iter()
            .cycle()
            .take(16)
            .map(|&reason| {
                let state = state.clone();
                tokio::spawn(async move { state.close(reason).then_some(reason) })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(reason) = handle.await.unwrap() {
                winners.push(reason);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(state.close_reason(), Some(winners[0]));
    }

    #[tokio::test]
    async fn test_wait_closed_wakes_on_close() {
        let state = Arc::new(SessionState::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        state.close(CloseReason::OutputClosed);

        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_closed_returns_when_already_closed() {
        let state = SessionState::new();
        state.close(CloseReason::EndOfStream);

        tokio::time::timeout(Duration::from_millis(100), state.wait_closed())
            .await
            .expect("already closed");
    }

    async fn session(
        broker: &MemoryBroker,
        active: Arc<AtomicUsize>,
    ) -> (Arc<StreamSession<crate::broker::memory::MemoryConnection>>, CloseSignal) {
        broker.create_topic("messages-room1", 1);
        let identity = broker.identities().issue("messages-room1");
        let connection = broker.connect(identity).await.unwrap();
        let cursor = connection
            .open_cursor("messages-room1", CursorParams::new(0, StartOffset::Oldest))
            .await
            .unwrap();
        let signal = cursor.close_signal();

        let state = Arc::new(SessionState::new());
        state.advance(Phase::Connected);
        let session = StreamSession::new(
            "messages-room1".to_string(),
            state,
            connection,
            signal.clone(),
            ActiveStreamGuard::new(active),
        );
        (Arc::new(session), signal)
    }

    #[tokio::test]
    async fn test_terminate_releases_once() {
        let broker = MemoryBroker::new();
        let active = Arc::new(AtomicUsize::new(0));
        let (session, cursor) = session(&broker, active.clone()).await;
        assert_eq!(active.load(Ordering::SeqCst), 1);

        let a = session.clone();
        let b = session.clone();
        let (first, second) = tokio::join!(
            a.terminate(CloseReason::ClientCancelled),
            b.terminate(CloseReason::EndOfStream)
        );

        assert!(first ^ second, "exactly one terminate call wins");
        assert!(cursor.is_closed());
        assert_eq!(broker.open_cursors(), 0);
        assert_eq!(broker.connections_closed(), 1);

        drop((a, b, session));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_watcher_releases_on_cancel() {
        let broker = MemoryBroker::new();
        let (session, cursor) = session(&broker, Arc::new(AtomicUsize::new(0))).await;
        let cancel = CancellationToken::new();

        let watcher = tokio::spawn(watch(session.clone(), cancel.clone()));
        cancel.cancel();
        watcher.await.unwrap();

        assert!(cursor.is_closed());
        assert_eq!(
            session.state().close_reason(),
            Some(CloseReason::ClientCancelled)
        );
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_watcher_exits_when_relay_closes_first() {
        let broker = MemoryBroker::new();
        let (session, _cursor) = session(&broker, Arc::new(AtomicUsize::new(0))).await;
        let cancel = CancellationToken::new();

        let watcher = tokio::spawn(watch(session.clone(), cancel.clone()));
        session.terminate(CloseReason::EndOfStream).await;

        tokio::time::timeout(Duration::from_millis(500), watcher)
            .await
            .expect("watcher should stop once the session is closed")
            .unwrap();

        // A late cancellation changes nothing
        cancel.cancel();
        assert_eq!(session.state().close_reason(), Some(CloseReason::EndOfStream));
        assert_eq!(broker.connections_closed(), 1);
    }
}
