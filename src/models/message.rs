use std::fmt;

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// A chat-style message exchanged through a destination.
///
/// The gateway only checks that a payload has this shape. The bytes that were
/// received are what gets stored and relayed, never a re-encoding of this
/// struct, so field order, whitespace and unknown fields survive untouched.
///
/// Decoding is lenient in the way the gateway's clients rely on:
///
/// - a missing field, or a `null` one, reads as an empty string
/// - keys match field names regardless of ASCII case (`Sender`, `MESSAGE`)
/// - when a field appears twice, the last occurrence wins
/// - unknown keys are ignored
/// - a top-level `null` is an empty message
///
/// Anything else that is not a JSON object, and any known field whose value is
/// not a string, is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Message {
    pub timestamp: String,
    pub sender: String,
    pub receiver: String,
    /// Message text, carried as `message` on the wire
    #[serde(rename = "message")]
    pub body: String,
}

impl Message {
    /// Check that `payload` is a well-formed message.
    pub fn parse(payload: &[u8]) -> AppResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Whether `payload` would be accepted by [`Message::parse`].
    pub fn is_valid(payload: &[u8]) -> bool {
        serde_json::from_slice::<Message>(payload).is_ok()
    }

    fn field_mut(&mut self, key: &str) -> Option<&mut String> {
        if key.eq_ignore_ascii_case("timestamp") {
            Some(&mut self.timestamp)
        } else if key.eq_ignore_ascii_case("sender") {
            Some(&mut self.sender)
        } else if key.eq_ignore_ascii_case("receiver") {
            Some(&mut self.receiver)
        } else if key.eq_ignore_ascii_case("message") {
            Some(&mut self.body)
        } else {
            None
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_option(MessageVisitor)
    }
}

struct MessageVisitor;

impl<'de> Visitor<'de> for MessageVisitor {
    type Value = Message;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a message object")
    }

    fn visit_none<E: de::Error>(self) -> Result<Message, E> {
        Ok(Message::default())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Message, E> {
        Ok(Message::default())
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Message, D::Error> {
        deserializer.deserialize_map(self)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Message, A::Error> {
        let mut message = Message::default();

        while let Some(key) = map.next_key::<String>()? {
            match message.field_mut(&key) {
                Some(slot) => {
                    // null leaves the field as it was
                    if let Some(value) = map.next_value::<Option<String>>()? {
                        *slot = value;
                    }
                }
                None => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        Ok(message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_parse_valid_message() {
        let msg =
            Message::parse(br#"{"timestamp":"t1","sender":"a","receiver":"b","message":"hi"}"#)
                .expect("valid message");

        assert_eq!(msg.timestamp, "t1");
        assert_eq!(msg.sender, "a");
        assert_eq!(msg.receiver, "b");
        assert_eq!(msg.body, "hi");
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let payload = br#"{"timestamp":"t1","sender":"a","receiver":"b","message":"hi","extra":[1,{"x":null}]}"#;
        assert!(Message::parse(payload).is_ok());
    }

    #[test]
    fn test_missing_fields_read_as_empty() {
        let msg = Message::parse(br#"{"timestamp":"t1","sender":"a","receiver":"b"}"#).unwrap();
        assert_eq!(msg.body, "");

        assert_eq!(Message::parse(b"{}").unwrap(), Message::default());
        assert_eq!(Message::parse(br#"{"sender":"a"}"#).unwrap().sender, "a");
    }

    #[test]
    fn test_keys_match_regardless_of_case() {
        let msg = Message::parse(
            br#"{"TimeStamp":"t1","Sender":"a","RECEIVER":"b","MESSAGE":"hi"}"#,
        )
        .unwrap();

        assert_eq!(msg.timestamp, "t1");
        assert_eq!(msg.sender, "a");
        assert_eq!(msg.receiver, "b");
        assert_eq!(msg.body, "hi");
    }

    #[test]
    fn test_last_duplicate_key_wins() {
        let msg = Message::parse(br#"{"sender":"a","Sender":"b"}"#).unwrap();
        assert_eq!(msg.sender, "b");
    }

    #[test]
    fn test_null_values_are_accepted() {
        let msg = Message::parse(br#"{"sender":null,"message":"hi"}"#).unwrap();
        assert_eq!(msg.sender, "");
        assert_eq!(msg.body, "hi");

        assert_eq!(Message::parse(b"null").unwrap(), Message::default());
    }

    #[test]
    fn test_parse_rejects_wrong_field_type() {
        let result = Message::parse(br#"{"timestamp":1,"sender":"a"}"#);
        assert!(matches!(result, Err(AppError::InvalidPayload(_))));
    }

    #[test]
    fn test_parse_rejects_non_objects() {
        assert!(!Message::is_valid(b"hello"));
        assert!(!Message::is_valid(b""));
        assert!(!Message::is_valid(b"[]"));
        assert!(!Message::is_valid(b"\"hi\""));
        assert!(!Message::is_valid(b"42"));
        assert!(!Message::is_valid(br#"{"sender":"a"} trailing"#));
    }
}
