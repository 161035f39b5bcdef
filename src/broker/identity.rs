//! Unique client identities for broker connections.
//!
//! Concurrent producers and consumers of the same topic must not share a
//! broker-side identity. Every connection therefore gets a name built from the
//! topic, a per-process instance tag, and a monotonic sequence number.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Length of the per-process instance tag.
const INSTANCE_TAG_LEN: usize = 8;

/// Identity of one broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Human-readable client name, e.g. `messages-room1-1a2b3c4d-7`
    pub name: String,
    /// Numeric consumer id for brokers that track consumers by number (never 0)
    pub consumer_id: u32,
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Issues [`ClientIdentity`] values that are unique within the process and,
/// through the instance tag, across gateway replicas.
#[derive(Debug)]
pub struct IdentityGenerator {
    instance: String,
    next: AtomicU64,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        let instance: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(INSTANCE_TAG_LEN)
            .collect();
        Self::with_instance(instance)
    }

    /// Generator with a fixed instance tag.
    pub fn with_instance(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Issue a fresh identity scoped to `scope` (usually a topic name).
    pub fn issue(&self, scope: &str) -> ClientIdentity {
        let seq = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        ClientIdentity {
            name: format!("{scope}-{}-{seq}", self.instance),
            consumer_id: consumer_id_for(seq),
        }
    }
}

impl Default for IdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a sequence number onto `1..=u32::MAX`, wrapping around.
fn consumer_id_for(seq: u64) -> u32 {
    let span = u64::from(u32::MAX);
    (seq.saturating_sub(1) % span) as u32 + 1
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_issue_is_monotonic_and_scoped() {
        let generator = IdentityGenerator::with_instance("abcd1234");

        let first = generator.issue("messages-room1");
        let second = generator.issue("messages-room1");

        assert_eq!(first.name, "messages-room1-abcd1234-1");
        assert_eq!(second.name, "messages-room1-abcd1234-2");
        assert_eq!(first.consumer_id, 1);
        assert_eq!(second.consumer_id, 2);
    }

    #[test]
    fn test_instance_tag_length() {
        let generator = IdentityGenerator::new();
        assert_eq!(generator.instance().len(), INSTANCE_TAG_LEN);
        assert!(generator.instance().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_consumer_id_never_zero() {
        assert_eq!(consumer_id_for(0), 1);
        assert_eq!(consumer_id_for(1), 1);
        assert_eq!(consumer_id_for(u64::from(u32::MAX)), u32::MAX);
        assert_eq!(consumer_id_for(u64::from(u32::MAX) + 1), 1);
    }

    #[tokio::test]
    async fn test_concurrent_issue_yields_unique_identities() {
        let generator = Arc::new(IdentityGenerator::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let generator = generator.clone();
            handles.push(tokio::spawn(async move {
                (0..50)
                    .map(|_| generator.issue("messages-room1").name)
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for name in handle.await.unwrap() {
                assert!(seen.insert(name), "duplicate identity issued");
            }
        }
        assert_eq!(seen.len(), 16 * 50);
    }
}
