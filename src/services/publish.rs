use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::broker::{Broker, BrokerConnection, OutboundRecord};
use crate::error::AppResult;
use crate::metrics;
use crate::models::{Destination, Message, PublishResponse};

/// Service accepting messages and appending them to their destination topic.
///
/// Every publish opens its own broker connection and closes it again,
/// whatever the outcome of the append.
#[derive(Clone)]
pub struct PublishService<B: Broker> {
    broker: B,
}

impl<B: Broker> PublishService<B> {
    pub fn new(broker: B) -> Self {
        Self { broker }
    }

    /// Validate `payload` and append it, unchanged, to the destination's topic.
    ///
    /// Invalid payloads are rejected before the broker is contacted.
    #[instrument(skip(self, payload), fields(topic = %destination.topic(), size = payload.len()))]
    pub async fn publish(
        &self,
        destination: &Destination,
        payload: Bytes,
    ) -> AppResult<PublishResponse> {
        let result = self.try_publish(destination, payload).await;

        let status = match &result {
            Ok(_) => "accepted",
            Err(e) => e.kind(),
        };
        metrics::record_message_published(status);

        result
    }

    async fn try_publish(
        &self,
        destination: &Destination,
        payload: Bytes,
    ) -> AppResult<PublishResponse> {
        Message::parse(&payload)?;

        let identity = self.broker.identities().issue(destination.topic());
        let connection = self.broker.connect(identity).await?;

        let now = Utc::now();
        let record = OutboundRecord {
            topic: destination.topic().to_string(),
            key: destination.routing_key(now),
            value: payload,
            timestamp: now,
        };

        let started = Instant::now();
        let appended = connection.append(&record).await;
        connection.close().await;

        let elapsed = started.elapsed().as_secs_f64();
        match &appended {
            Ok(()) => metrics::record_append_duration("ok", elapsed),
            Err(e) => metrics::record_append_duration(e.kind(), elapsed),
        }
        appended?;

        debug!(client = %connection.identity(), key = %record.key, "Message published");
        Ok(PublishResponse::accepted(record.topic, Utc::now()))
    }
}
