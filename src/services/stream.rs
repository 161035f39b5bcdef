use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use super::lifecycle::{ActiveStreamGuard, CloseReason, Phase, SessionState, StreamSession, watch};
use crate::broker::{Broker, BrokerConnection, Cursor, StartOffset};
use crate::config::{BrokerConfig, STREAM_PARTITION};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Destination, Message};

/// A running stream: newline-terminated messages arrive on `output`.
///
/// Dropping the receiver ends the stream with [`CloseReason::OutputClosed`];
/// cancelling the token passed to [`StreamService::open`] ends it with
/// [`CloseReason::ClientCancelled`].
pub struct StreamHandle {
    pub topic: String,
    /// Broker client name of this stream
    pub client: String,
    pub output: mpsc::Receiver<Bytes>,
    pub state: Arc<SessionState>,
}

/// Service relaying a destination's topic to long-lived stream clients.
///
/// Each stream runs two tasks on the shared [`TaskTracker`]: the relay, which
/// owns the cursor, and a watcher waiting for the client to cancel.
#[derive(Clone)]
pub struct StreamService<B: Broker> {
    broker: B,
    config: Arc<BrokerConfig>,
    relay_buffer: usize,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
}

impl<B: Broker> StreamService<B> {
    pub fn new(broker: B, config: BrokerConfig, relay_buffer: usize, tracker: TaskTracker) -> Self {
        Self {
            broker,
            config: Arc::new(config),
            relay_buffer: relay_buffer.max(1),
            tracker,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of streams whose resources are still held.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Open a stream on `destination` starting at `start`.
    ///
    /// Connection and cursor failures are returned here; anything after that
    /// only ends the output.
    #[instrument(skip(self, cancel), fields(topic = %destination.topic(), start = start.as_str()))]
    pub async fn open(
        &self,
        destination: &Destination,
        start: StartOffset,
        cancel: CancellationToken,
    ) -> AppResult<StreamHandle> {
        let topic = destination.topic().to_string();
        let state = Arc::new(SessionState::new());

        let identity = self.broker.identities().issue(&topic);
        let client = identity.name.clone();
        let pending = PendingConnection::new(
            self.broker.connect(identity).await?,
            self.tracker.clone(),
        );
        state.advance(Phase::Connected);

        let params = self.config.cursor_params(start);
        let opened = pending.get()?.open_cursor(&topic, params).await;
        let cursor = match opened {
            Ok(cursor) => cursor,
            Err(e) => {
                pending.into_inner()?.close().await;
                return Err(e);
            }
        };
        let connection = pending.into_inner()?;

        let (tx, rx) = mpsc::channel(self.relay_buffer);
        let session = Arc::new(StreamSession::new(
            topic.clone(),
            state.clone(),
            connection,
            cursor.close_signal(),
            ActiveStreamGuard::new(self.active.clone()),
        ));

        metrics::record_stream_opened(start.as_str());
        debug!(%client, partition = STREAM_PARTITION, "Stream opened");

        self.tracker.spawn(watch(session.clone(), cancel));
        self.tracker.spawn(relay(session, cursor, tx));

        Ok(StreamHandle {
            topic,
            client,
            output: rx,
            state,
        })
    }
}

/// A connection not yet owned by a [`StreamSession`].
///
/// If the request is abandoned while the stream is still opening, dropping
/// this closes the connection on the tracker instead of leaking it.
struct PendingConnection<C: BrokerConnection> {
    connection: Option<C>,
    tracker: TaskTracker,
}

impl<C: BrokerConnection> PendingConnection<C> {
    fn new(connection: C, tracker: TaskTracker) -> Self {
        Self {
            connection: Some(connection),
            tracker,
        }
    }

    fn get(&self) -> AppResult<&C> {
        self.connection
            .as_ref()
            .ok_or_else(|| AppError::Internal("connection already handed over".to_string()))
    }

    fn into_inner(mut self) -> AppResult<C> {
        self.connection
            .take()
            .ok_or_else(|| AppError::Internal("connection already handed over".to_string()))
    }
}

impl<C: BrokerConnection> Drop for PendingConnection<C> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        debug!(client = %connection.identity(), "Stream abandoned while opening");
        self.tracker
            .spawn_on(async move { connection.close().await }, &runtime);
    }
}

/// Forward every record that is a message, in offset order, until the stream ends.
async fn relay<C: BrokerConnection>(
    session: Arc<StreamSession<C>>,
    mut cursor: C::Cursor,
    output: mpsc::Sender<Bytes>,
) {
    if !session.state().advance(Phase::Streaming) {
        // Cancelled before the first read; the watcher released everything
        return;
    }

    let reason = loop {
        let next = tokio::select! {
            biased;

            _ = output.closed() => break CloseReason::OutputClosed,
            next = cursor.next() => next,
        };

        let record = match next {
            Ok(Some(record)) => record,
            Ok(None) => break CloseReason::EndOfStream,
            Err(e) => {
                warn!(topic = %session.topic(), error = %e, "Cursor read failed");
                break CloseReason::ReadError;
            }
        };

        if !Message::is_valid(&record.payload) {
            debug!(
                topic = %session.topic(),
                offset = record.offset,
                "Skipping record that is not a message"
            );
            metrics::record_message_dropped();
            continue;
        }

        let mut line = BytesMut::with_capacity(record.payload.len() + 1);
        line.put_slice(&record.payload);
        line.put_u8(b'\n');

        tokio::select! {
            biased;

            _ = session.state().wait_closed() => break CloseReason::ClientCancelled,
            sent = output.send(line.freeze()) => {
                if sent.is_err() {
                    break CloseReason::OutputClosed;
                }
                metrics::record_message_relayed();
            }
        }
    };

    session.terminate(reason).await;
}
