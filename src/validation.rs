use crate::error::{AppError, AppResult};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length for broker resource names (streams, topics).
///
/// Iggy's limit for named identifiers.
pub const MAX_NAME_LENGTH: usize = 255;

/// Maximum length for destination ids.
///
/// Leaves room for the topic prefix within [`MAX_NAME_LENGTH`].
pub const MAX_DESTINATION_ID_LENGTH: usize = 200;

/// Validate a topic name derived from a destination.
///
/// Topic names follow the broker's identifier limit and the destination id
/// character set, so a misconfigured prefix is caught here.
pub fn validate_topic_name(topic: &str) -> AppResult<()> {
    if topic.is_empty() {
        return Err(AppError::BadRequest("Topic name cannot be empty".to_string()));
    }

    if topic.len() > MAX_NAME_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Topic name cannot exceed {MAX_NAME_LENGTH} characters"
        )));
    }

    if let Some((i, c)) = find_invalid_char(topic) {
        return Err(AppError::BadRequest(format!(
            "Topic name contains invalid character '{c}' at position {i}"
        )));
    }

    Ok(())
}

/// Validate a destination id taken from the request path.
///
/// Ids may contain alphanumeric characters, dots, underscores, and hyphens.
/// The derived topic name is checked separately.
pub fn validate_destination_id(id: &str) -> AppResult<()> {
    if id.is_empty() {
        return Err(AppError::BadRequest(
            "Destination id cannot be empty".to_string(),
        ));
    }

    if id.len() > MAX_DESTINATION_ID_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Destination id cannot exceed {MAX_DESTINATION_ID_LENGTH} characters"
        )));
    }

    if let Some((i, c)) = find_invalid_char(id) {
        return Err(AppError::BadRequest(format!(
            "Destination id contains invalid character '{c}' at position {i}"
        )));
    }

    Ok(())
}

fn find_invalid_char(name: &str) -> Option<(usize, char)> {
    name.char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
}
