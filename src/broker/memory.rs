//! In-process broker.
//!
//! A small partitioned log kept in memory. It behaves like the real broker
//! where the gateway can observe it (ordering, offsets, unknown topics,
//! unreachable endpoint) and additionally keeps resource accounting so tests
//! can check that every connection and cursor was released.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, trace};

use super::{
    Broker, BrokerConnection, ClientIdentity, CloseSignal, Cursor, CursorParams,
    IdentityGenerator, OutboundRecord, Record, StartOffset,
};
use crate::error::{AppError, AppResult};

#[derive(Debug, Default)]
struct TopicLog {
    partitions: Vec<Vec<Record>>,
    /// No more records will arrive; cursors end once drained.
    sealed: bool,
    /// Next read on this topic fails.
    fail_reads: bool,
}

#[derive(Debug)]
struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
    appended: Notify,
    reachable: AtomicBool,
    auto_create_topics: bool,
    partitions: u32,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    /// Connections released by drop without an explicit close.
    connections_dropped: AtomicUsize,
    append_calls: AtomicUsize,
    cursor_open_delay_ms: AtomicU64,
    cursors: Mutex<Vec<CloseSignal>>,
}

impl Inner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, TopicLog>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cursors(&self) -> MutexGuard<'_, Vec<CloseSignal>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker with resource accounting.
///
/// Cloning yields another handle to the same log.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
    identities: Arc<IdentityGenerator>,
}

impl MemoryBroker {
    /// Broker with single-partition topics created on first append.
    pub fn new() -> Self {
        Self::with_options(1, true)
    }

    pub fn with_options(partitions: u32, auto_create_topics: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                reachable: AtomicBool::new(true),
                auto_create_topics,
                partitions: partitions.max(1),
                connections_opened: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
                connections_dropped: AtomicUsize::new(0),
                append_calls: AtomicUsize::new(0),
                cursor_open_delay_ms: AtomicU64::new(0),
                cursors: Mutex::new(Vec::new()),
            }),
            identities: Arc::new(IdentityGenerator::new()),
        }
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Create a topic explicitly.
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut topics = self.inner.topics();
        topics.entry(topic.to_string()).or_insert_with(|| TopicLog {
            partitions: vec![Vec::new(); partitions.max(1) as usize],
            ..TopicLog::default()
        });
    }

    /// Make every cursor open wait `delay` before answering.
    pub fn set_cursor_open_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.inner.cursor_open_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Mark a topic as finished: cursors end after draining it.
    pub fn seal(&self, topic: &str) {
        if let Some(log) = self.inner.topics().get_mut(topic) {
            log.sealed = true;
        }
        self.inner.appended.notify_waiters();
    }

    /// Make the next cursor read on `topic` fail.
    pub fn fail_reads(&self, topic: &str) {
        if let Some(log) = self.inner.topics().get_mut(topic) {
            log.fail_reads = true;
        }
        self.inner.appended.notify_waiters();
    }

    /// Payloads stored in one partition, in offset order.
    pub fn records(&self, topic: &str, partition: u32) -> Vec<Bytes> {
        self.inner
            .topics()
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize))
            .map(|records| records.iter().map(|r| r.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn append_calls(&self) -> usize {
        self.inner.append_calls.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    /// Connections that were dropped without ever being closed.
    pub fn connections_dropped(&self) -> usize {
        self.inner.connections_dropped.load(Ordering::SeqCst)
    }

    /// Connections opened but not yet released.
    pub fn open_connections(&self) -> usize {
        self.connections_opened()
            .saturating_sub(self.connections_closed())
    }

    /// Cursors opened but not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.inner
            .cursors()
            .iter()
            .filter(|signal| !signal.is_closed())
            .count()
    }

    fn ensure_reachable(&self) -> AppResult<()> {
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::BrokerUnreachable(
                "memory broker is marked unreachable".to_string(),
            ))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    fn identities(&self) -> &IdentityGenerator {
        &self.identities
    }

    async fn connect(&self, identity: ClientIdentity) -> AppResult<MemoryConnection> {
        self.ensure_reachable()?;
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        trace!(client = %identity, "Memory connection opened");

        Ok(MemoryConnection {
            broker: self.clone(),
            identity,
            closed: AtomicBool::new(false),
        })
    }
}

/// Connection to a [`MemoryBroker`].
///
/// Dropping an unclosed connection releases it as well.
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    identity: ClientIdentity,
    closed: AtomicBool,
}

impl MemoryConnection {
    /// Returns `true` for the call that released the connection.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.broker
            .inner
            .connections_closed
            .fetch_add(1, Ordering::SeqCst);
        trace!(client = %self.identity, "Memory connection released");
        true
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.release() {
            self.broker
                .inner
                .connections_dropped
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl BrokerConnection for MemoryConnection {
    type Cursor = MemoryCursor;

    fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    async fn append(&self, record: &OutboundRecord) -> AppResult<()> {
        let inner = &self.broker.inner;
        inner.append_calls.fetch_add(1, Ordering::SeqCst);
        self.broker
            .ensure_reachable()
            .map_err(|e| AppError::AppendFailed(e.to_string()))?;

        {
            let mut topics = inner.topics();
            if !topics.contains_key(&record.topic) {
                if !inner.auto_create_topics {
                    return Err(AppError::AppendFailed(format!(
                        "unknown topic '{}'",
                        record.topic
                    )));
                }
                topics.insert(
                    record.topic.clone(),
                    TopicLog {
                        partitions: vec![Vec::new(); inner.partitions as usize],
                        ..TopicLog::default()
                    },
                );
            }

            let log = topics.get_mut(&record.topic).ok_or_else(|| {
                AppError::Internal(format!("topic '{}' vanished", record.topic))
            })?;
            let partition_count = log.partitions.len().max(1);
            let index = partition_for(&record.key, partition_count);
            let partition = log.partitions.get_mut(index).ok_or_else(|| {
                AppError::Internal(format!("partition {index} out of range"))
            })?;

            let offset = partition.len() as u64;
            partition.push(Record {
                offset,
                timestamp: record.timestamp.timestamp_micros().max(0) as u64,
                payload: record.value.clone(),
            });
            debug!(topic = %record.topic, partition = index, offset, "Record appended");
        }

        inner.appended.notify_waiters();
        Ok(())
    }

    async fn open_cursor(&self, topic: &str, params: CursorParams) -> AppResult<MemoryCursor> {
        self.broker.ensure_reachable()?;

        let delay = self.broker.inner.cursor_open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }

        let position = {
            let topics = self.broker.inner.topics();
            let log = topics
                .get(topic)
                .ok_or_else(|| AppError::NotFound(format!("Topic '{topic}' not found")))?;
            let partition = log.partitions.get(params.partition as usize).ok_or_else(|| {
                AppError::NotFound(format!(
                    "Partition {} of topic '{topic}' not found",
                    params.partition
                ))
            })?;

            match params.start {
                StartOffset::Oldest => 0,
                StartOffset::Newest => partition.len(),
            }
        };

        let close = CloseSignal::new();
        self.broker.inner.cursors().push(close.clone());

        Ok(MemoryCursor {
            broker: self.broker.clone(),
            topic: topic.to_string(),
            params,
            position,
            close,
        })
    }

    async fn close(&self) {
        self.release();
    }
}

/// Cursor over one partition of a [`MemoryBroker`] topic.
#[derive(Debug)]
pub struct MemoryCursor {
    broker: MemoryBroker,
    topic: String,
    params: CursorParams,
    position: usize,
    close: CloseSignal,
}

enum Poll {
    Ready(Record),
    Ended,
    Failed,
    Empty,
}

impl MemoryCursor {
    fn poll_log(&self) -> Poll {
        let mut topics = self.broker.inner.topics();
        let Some(log) = topics.get_mut(&self.topic) else {
            return Poll::Ended;
        };

        if log.fail_reads {
            log.fail_reads = false;
            return Poll::Failed;
        }

        let next = log
            .partitions
            .get(self.params.partition as usize)
            .and_then(|records| records.get(self.position))
            .cloned();

        match next {
            Some(record) => Poll::Ready(record),
            None if log.sealed => Poll::Ended,
            None => Poll::Empty,
        }
    }
}

impl Cursor for MemoryCursor {
    async fn next(&mut self) -> AppResult<Option<Record>> {
        loop {
            if self.close.is_closed() {
                return Ok(None);
            }

            // Register interest before looking so an append in between is not missed
            let appended = self.broker.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if !self.broker.inner.reachable.load(Ordering::SeqCst) {
                return Err(AppError::ReadError(
                    "memory broker is marked unreachable".to_string(),
                ));
            }

            match self.poll_log() {
                Poll::Ready(record) => {
                    self.position += 1;
                    return Ok(Some(record));
                }
                Poll::Ended => return Ok(None),
                Poll::Failed => {
                    return Err(AppError::ReadError(format!(
                        "injected read failure on '{}'",
                        self.topic
                    )));
                }
                Poll::Empty => {}
            }

            tokio::select! {
                biased;

                _ = self.close.closed() => return Ok(None),
                _ = &mut appended => {}
                _ = sleep(self.params.max_wait) => {}
            }
        }
    }

    fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn record(topic: &str, value: &'static str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_string(),
            key: format!("{topic}-1"),
            value: Bytes::from_static(value.as_bytes()),
            timestamp: Utc::now(),
        }
    }

    fn params(start: StartOffset) -> CursorParams {
        CursorParams::new(0, start).with_max_wait(Duration::from_millis(50))
    }

    async fn connect(broker: &MemoryBroker) -> MemoryConnection {
        let identity = broker.identities().issue("test");
        broker.connect(identity).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_then_read_in_order() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        conn.append(&record("t", "one")).await.unwrap();
        conn.append(&record("t", "two")).await.unwrap();

        let mut cursor = conn.open_cursor("t", params(StartOffset::Oldest)).await.unwrap();
        let first = cursor.next().await.unwrap().unwrap();
        let second = cursor.next().await.unwrap().unwrap();

        assert_eq!(first.offset, 0);
        assert_eq!(first.payload, Bytes::from_static(b"one"));
        assert_eq!(second.offset, 1);
        assert_eq!(second.payload, Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn test_newest_skips_existing_records() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        conn.append(&record("t", "old")).await.unwrap();

        let mut cursor = conn.open_cursor("t", params(StartOffset::Newest)).await.unwrap();
        conn.append(&record("t", "new")).await.unwrap();

        let next = cursor.next().await.unwrap().unwrap();
        assert_eq!(next.payload, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_open_cursor_on_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        let result = conn.open_cursor("missing", params(StartOffset::Oldest)).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_open_cursor_on_unknown_partition_fails() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 1);
        let conn = connect(&broker).await;

        let params = CursorParams::new(3, StartOffset::Oldest);
        let result = conn.open_cursor("t", params).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_append_without_auto_create_fails() {
        let broker = MemoryBroker::with_options(1, false);
        let conn = connect(&broker).await;

        let result = conn.append(&record("t", "x")).await;
        assert!(matches!(result, Err(AppError::AppendFailed(_))));
        assert_eq!(broker.append_calls(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_rejects_connections() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        let identity = broker.identities().issue("t");
        let result = broker.connect(identity).await;
        assert!(matches!(result, Err(AppError::BrokerUnreachable(_))));
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_next() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 1);
        let conn = connect(&broker).await;

        let params = CursorParams::new(0, StartOffset::Oldest).with_max_wait(Duration::from_secs(30));
        let mut cursor = conn.open_cursor("t", params).await.unwrap();
        let signal = cursor.close_signal();

        let reader = tokio::spawn(async move { cursor.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(signal.close());

        let result = tokio::time::timeout(Duration::from_millis(500), reader)
            .await
            .expect("next() should unblock on close")
            .unwrap();
        assert!(matches!(result, Ok(None)));
        assert_eq!(broker.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_sealed_topic_ends_cursor_after_drain() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        conn.append(&record("t", "last")).await.unwrap();
        broker.seal("t");

        let mut cursor = conn.open_cursor("t", params(StartOffset::Oldest)).await.unwrap();
        assert!(cursor.next().await.unwrap().is_some());
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let broker = MemoryBroker::new();
        broker.create_topic("t", 1);
        let conn = connect(&broker).await;
        let mut cursor = conn.open_cursor("t", params(StartOffset::Oldest)).await.unwrap();

        broker.fail_reads("t");
        assert!(matches!(cursor.next().await, Err(AppError::ReadError(_))));
    }

    #[tokio::test]
    async fn test_connection_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        conn.close().await;
        conn.close().await;
        drop(conn);

        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(broker.connections_closed(), 1);
        assert_eq!(broker.connections_dropped(), 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_counted() {
        let broker = MemoryBroker::new();
        drop(connect(&broker).await);

        assert_eq!(broker.connections_closed(), 1);
        assert_eq!(broker.connections_dropped(), 1);
    }

    #[test]
    fn test_partition_for_is_stable() {
        assert_eq!(partition_for("key", 4), partition_for("key", 4));
        assert!(partition_for("key", 4) < 4);
        assert_eq!(partition_for("anything", 1), 0);
    }
}
