//! Helper functions for broker implementations.

use std::time::Duration;

use iggy::prelude::Identifier;

use crate::error::AppError;

/// Jitter percentage applied to retry delays (±20%).
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Minimum delay between append attempts in milliseconds.
const MIN_RETRY_DELAY_MS: u64 = 50;

/// Convert a string to an Iggy identifier, returning an appropriate error on failure.
///
/// Iggy only limits named identifiers by length.
pub fn to_identifier(name: &str, resource_type: &str) -> Result<Identifier, AppError> {
    name.try_into().map_err(|e: iggy::prelude::IggyError| {
        tracing::debug!(
            resource_type,
            name,
            original_error = %e,
            "Identifier conversion failed"
        );
        AppError::BadRequest(format!(
            "Invalid {} name '{}': must be 1-255 characters",
            resource_type, name
        ))
    })
}

/// Generate a random jitter value between 0.0 and 1.0.
fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

/// Delay before the next append attempt, `base` with ±20% jitter.
pub(crate) fn retry_delay(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let jitter = (base_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
    let delay_ms = (base_ms as i64 + jitter).max(MIN_RETRY_DELAY_MS as i64) as u64;
    Duration::from_millis(delay_ms)
}
