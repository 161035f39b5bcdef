//! Parameters for opening cursors.

use std::time::Duration;

use super::StartOffset;

/// Default number of records fetched per broker round-trip.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Default wait between polls of an idle partition.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1);

/// Default bound on a single broker read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for opening a cursor on a topic partition.
///
/// # Example
///
/// ```rust,ignore
/// let params = CursorParams::new(0, StartOffset::Oldest)
///     .with_batch_size(50)
///     .with_max_wait(Duration::from_millis(500));
///
/// let cursor = connection.open_cursor("messages-room1", params).await?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorParams {
    /// Partition to read
    pub partition: u32,
    /// Initial position
    pub start: StartOffset,
    /// Maximum records fetched per round-trip
    pub batch_size: u32,
    /// How long an idle cursor waits before asking the broker again
    pub max_wait: Duration,
    /// Upper bound on one broker read before it counts as failed
    pub read_timeout: Duration,
}

impl CursorParams {
    /// Create cursor parameters with default batching and waits.
    pub fn new(partition: u32, start: StartOffset) -> Self {
        Self {
            partition,
            start,
            batch_size: DEFAULT_BATCH_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_params_new_with_defaults() {
        let params = CursorParams::new(0, StartOffset::Newest);

        assert_eq!(params.partition, 0);
        assert_eq!(params.start, StartOffset::Newest);
        assert_eq!(params.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(params.max_wait, Duration::from_secs(1));
        assert_eq!(params.read_timeout, DEFAULT_READ_TIMEOUT);
    }

    #[test]
    fn test_cursor_params_builder_chain() {
        let params = CursorParams::new(2, StartOffset::Oldest)
            .with_batch_size(10)
            .with_max_wait(Duration::from_millis(250))
            .with_read_timeout(Duration::from_secs(2));

        assert_eq!(params.partition, 2);
        assert_eq!(params.batch_size, 10);
        assert_eq!(params.max_wait, Duration::from_millis(250));
        assert_eq!(params.read_timeout, Duration::from_secs(2));
    }
}
