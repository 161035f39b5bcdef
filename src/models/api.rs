use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response after a message was accepted by the broker.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Always `accepted`
    pub status: String,
    /// Topic the message was appended to
    pub topic: String,
    /// Time the broker acknowledged the append
    pub timestamp: DateTime<Utc>,
}

impl PublishResponse {
    pub fn accepted(topic: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            status: "accepted".to_string(),
            topic: topic.into(),
            timestamp,
        }
    }
}

/// Query parameters of a stream request.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// `oldest`/`true` (default) or `newest`/`false`
    pub start: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since the gateway started
    pub uptime_seconds: u64,
    /// Streams currently relaying
    pub active_streams: usize,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Readiness check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub broker_reachable: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_response_serialization() {
        let response = PublishResponse::accepted("messages-room1", Utc::now());
        let json = serde_json::to_value(&response).expect("Serialization should succeed");

        assert_eq!(json["status"], "accepted");
        assert_eq!(json["topic"], "messages-room1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_stream_query_start_is_optional() {
        let query: StreamQuery = serde_json::from_str("{}").expect("Deserialization should succeed");
        assert!(query.start.is_none());
    }
}
