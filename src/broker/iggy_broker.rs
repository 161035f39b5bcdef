//! Apache Iggy implementation of the broker facade.
//!
//! Each [`IggyConnection`] owns its own `IggyClient`; there is no pooling and
//! no reconnection. A failed connection fails the request that opened it.
//!
//! # Topic layout
//!
//! Gateway topics live inside a single Iggy stream ([`BrokerConfig::stream`]).
//! Iggy does not create topics implicitly, so when
//! [`BrokerConfig::auto_create_topics`] is set the stream and topic are ensured
//! before an append.
//!
//! # Cursors
//!
//! An [`IggyCursor`] reads with explicit offsets and never commits, so any
//! number of cursors on the same partition are independent of each other.
//! Records are fetched in batches; an empty poll makes the cursor wait
//! [`CursorParams::max_wait`] (or until closed) before asking again.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use iggy::prelude::*;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use super::helpers::retry_delay;
use super::{
    Broker, BrokerConnection, ClientIdentity, CloseSignal, Cursor, CursorParams,
    IdentityGenerator, OutboundRecord, Record, StartOffset, to_identifier,
};
use crate::config::BrokerConfig;
use crate::error::{AppError, AppResult};

/// Iggy-backed broker.
#[derive(Clone)]
pub struct IggyBroker {
    config: Arc<BrokerConfig>,
    identities: Arc<IdentityGenerator>,
}

impl IggyBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            identities: Arc::new(IdentityGenerator::new()),
        }
    }
}

impl Broker for IggyBroker {
    type Connection = IggyConnection;

    fn identities(&self) -> &IdentityGenerator {
        &self.identities
    }

    #[instrument(skip(self), fields(client = %identity))]
    async fn connect(&self, identity: ClientIdentity) -> AppResult<IggyConnection> {
        let client = IggyClient::from_connection_string(&self.config.connection_string)
            .map_err(|e| AppError::BrokerUnreachable(e.to_string()))?;

        match timeout(self.config.connect_timeout, client.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(AppError::BrokerUnreachable(e.to_string())),
            Err(_) => {
                return Err(AppError::BrokerUnreachable(format!(
                    "no broker answered within {:?}",
                    self.config.connect_timeout
                )));
            }
        }

        debug!("Broker connection established");

        Ok(IggyConnection {
            client: Arc::new(client),
            identity,
            config: self.config.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// One client-scoped Iggy connection.
pub struct IggyConnection {
    client: Arc<IggyClient>,
    identity: ClientIdentity,
    config: Arc<BrokerConfig>,
    closed: AtomicBool,
}

impl IggyConnection {
    fn stream_id(&self) -> AppResult<Identifier> {
        to_identifier(&self.config.stream, "stream")
    }

    /// Ensure the gateway stream exists, creating it if necessary.
    async fn ensure_stream(&self) -> AppResult<()> {
        let stream_id = self.stream_id()?;

        if let Ok(Some(_)) = self.client.get_stream(&stream_id).await {
            return Ok(());
        }

        info!(stream = %self.config.stream, "Creating stream");
        if let Err(e) = self.client.create_stream(&self.config.stream).await {
            // Another connection may have created it in the meantime
            match self.client.get_stream(&stream_id).await {
                Ok(Some(_)) => {}
                _ => return Err(AppError::AppendFailed(e.to_string())),
            }
        }
        Ok(())
    }

    /// Ensure `topic` exists within the gateway stream, creating it if necessary.
    async fn ensure_topic(&self, topic: &str) -> AppResult<()> {
        let stream_id = self.stream_id()?;
        let topic_id = to_identifier(topic, "topic")?;

        if let Ok(Some(_)) = self.client.get_topic(&stream_id, &topic_id).await {
            return Ok(());
        }

        self.ensure_stream().await?;

        info!(topic, partitions = self.config.topic_partitions, "Creating topic");
        let created = self
            .client
            .create_topic(
                &stream_id,
                topic,
                self.config.topic_partitions,
                Default::default(),
                None,
                IggyExpiry::NeverExpire,
                MaxTopicSize::Unlimited,
            )
            .await;

        if let Err(e) = created {
            match self.client.get_topic(&stream_id, &topic_id).await {
                Ok(Some(_)) => {}
                _ => return Err(AppError::AppendFailed(e.to_string())),
            }
        }
        Ok(())
    }

    /// A single append attempt, returning once the broker acknowledged it.
    async fn send_once(&self, record: &OutboundRecord) -> AppResult<()> {
        let stream_id = self.stream_id()?;
        let topic_id = to_identifier(&record.topic, "topic")?;

        // The value was accepted as JSON, so it is valid UTF-8
        let payload = std::str::from_utf8(&record.value)
            .map_err(|e| AppError::AppendFailed(format!("record value is not UTF-8: {e}")))?;
        let message =
            IggyMessage::from_str(payload).map_err(|e| AppError::AppendFailed(e.to_string()))?;

        let partitioning = Partitioning::messages_key_str(&record.key)
            .map_err(|e| AppError::AppendFailed(e.to_string()))?;

        // Iggy stamps records itself on arrival; record.timestamp is not sent
        let mut messages = vec![message];
        self.client
            .send_messages(&stream_id, &topic_id, &partitioning, &mut messages)
            .await
            .map_err(|e| AppError::AppendFailed(e.to_string()))
    }
}

impl BrokerConnection for IggyConnection {
    type Cursor = IggyCursor;

    fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    #[instrument(skip(self, record), fields(client = %self.identity, topic = %record.topic))]
    async fn append(&self, record: &OutboundRecord) -> AppResult<()> {
        if self.config.auto_create_topics {
            timeout(self.config.append_timeout, self.ensure_topic(&record.topic))
                .await
                .map_err(|_| {
                    AppError::AppendTimeout(format!(
                        "topic lookup got no answer within {:?}",
                        self.config.append_timeout
                    ))
                })??;
        }

        let attempts = 1 + self.config.append_max_retries;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                sleep(retry_delay(self.config.append_timeout / 4)).await;
            }

            match timeout(self.config.append_timeout, self.send_once(record)).await {
                Ok(Ok(())) => {
                    debug!(attempt, "Record acknowledged");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Append attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(attempt, timeout = ?self.config.append_timeout, "Append attempt timed out");
                    last_error = Some(AppError::AppendTimeout(format!(
                        "no acknowledgment within {:?}",
                        self.config.append_timeout
                    )));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::AppendFailed("no append attempt was made".to_string())))
    }

    #[instrument(skip(self), fields(client = %self.identity))]
    async fn open_cursor(&self, topic: &str, params: CursorParams) -> AppResult<IggyCursor> {
        let stream_id = self.stream_id()?;
        let topic_id = to_identifier(topic, "topic")?;

        let details = timeout(
            params.read_timeout,
            self.client.get_topic(&stream_id, &topic_id),
        )
        .await
        .map_err(|_| {
            AppError::BrokerUnreachable(format!(
                "topic lookup timed out after {:?}",
                params.read_timeout
            ))
        })?
        .map_err(|e| AppError::BrokerUnreachable(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("Topic '{topic}' not found")))?;

        let partition = details
            .partitions
            .iter()
            .find(|p| p.id == params.partition)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Partition {} of topic '{topic}' not found",
                    params.partition
                ))
            })?;

        let next_offset = match params.start {
            StartOffset::Oldest => 0,
            StartOffset::Newest if partition.messages_count == 0 => 0,
            StartOffset::Newest => partition.current_offset + 1,
        };

        let consumer = Consumer::new(Identifier::numeric(self.identity.consumer_id).map_err(
            |e| AppError::Internal(format!("invalid consumer id: {e}")),
        )?);

        debug!(topic, next_offset, "Cursor opened");

        Ok(IggyCursor {
            client: self.client.clone(),
            stream_id,
            topic_id,
            consumer,
            params,
            next_offset,
            buffered: VecDeque::new(),
            close: CloseSignal::new(),
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.client.disconnect().await {
            debug!(client = %self.identity, error = %e, "Disconnect reported an error");
        }
        debug!(client = %self.identity, "Broker connection closed");
    }
}

/// Offset-tracking read handle on one Iggy partition.
pub struct IggyCursor {
    client: Arc<IggyClient>,
    stream_id: Identifier,
    topic_id: Identifier,
    consumer: Consumer,
    params: CursorParams,
    next_offset: u64,
    buffered: VecDeque<Record>,
    close: CloseSignal,
}

impl Cursor for IggyCursor {
    async fn next(&mut self) -> AppResult<Option<Record>> {
        loop {
            if self.close.is_closed() {
                return Ok(None);
            }

            if let Some(record) = self.buffered.pop_front() {
                return Ok(Some(record));
            }

            let strategy = PollingStrategy::offset(self.next_offset);
            let poll = self.client.poll_messages(
                &self.stream_id,
                &self.topic_id,
                Some(self.params.partition),
                &self.consumer,
                &strategy,
                self.params.batch_size,
                false,
            );

            let polled = tokio::select! {
                biased;

                _ = self.close.closed() => return Ok(None),
                result = timeout(self.params.read_timeout, poll) => match result {
                    Ok(Ok(polled)) => polled,
                    Ok(Err(e)) => return Err(AppError::ReadError(e.to_string())),
                    Err(_) => {
                        return Err(AppError::ReadError(format!(
                            "poll timed out after {:?}",
                            self.params.read_timeout
                        )));
                    }
                },
            };

            if polled.messages.is_empty() {
                tokio::select! {
                    biased;

                    _ = self.close.closed() => return Ok(None),
                    _ = sleep(self.params.max_wait) => {}
                }
                continue;
            }

            for message in polled.messages {
                let offset = message.header.offset;
                if offset < self.next_offset {
                    continue;
                }
                self.next_offset = offset + 1;
                self.buffered.push_back(Record {
                    offset,
                    timestamp: message.header.timestamp,
                    payload: Bytes::from(message.payload),
                });
            }
        }
    }

    fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }
}
