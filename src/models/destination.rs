use chrono::{DateTime, Utc};

use crate::error::AppResult;
use crate::validation::{validate_destination_id, validate_topic_name};

/// A client-facing destination and the broker topic behind it.
///
/// One id maps to exactly one topic: `{prefix}{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    id: String,
    topic: String,
}

impl Destination {
    /// Resolve a destination id against the configured topic prefix.
    pub fn from_id(id: &str, prefix: &str) -> AppResult<Self> {
        validate_destination_id(id)?;
        let topic = format!("{prefix}{id}");
        validate_topic_name(&topic)?;

        Ok(Self {
            id: id.to_string(),
            topic,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Key used by the broker to pick a partition for a record published at `at`.
    pub fn routing_key(&self, at: DateTime<Utc>) -> String {
        format!("{}-{}", self.topic, at.timestamp())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_topic_is_prefix_plus_id() {
        let dest = Destination::from_id("room1", "messages-").unwrap();
        assert_eq!(dest.id(), "room1");
        assert_eq!(dest.topic(), "messages-room1");
    }

    #[test]
    fn test_routing_key_uses_unix_seconds() {
        let dest = Destination::from_id("room1", "messages-").unwrap();
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(dest.routing_key(at), "messages-room1-1700000000");
    }

    #[test]
    fn test_invalid_id_is_client_error() {
        let err = Destination::from_id("room 1", "messages-").unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_ids_with_repeated_separators_are_accepted() {
        for id in ["room..1", "-x", "a_-_b"] {
            let dest = Destination::from_id(id, "messages-").unwrap();
            assert_eq!(dest.topic(), format!("messages-{id}"));
        }
    }

    #[test]
    fn test_prefix_must_produce_valid_topic() {
        let err = Destination::from_id("room1", "messages/").unwrap_err();
        assert!(err.is_client_error());
    }
}
