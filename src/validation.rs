//! Input validation for queue names, message ids and SQL identifiers
//!
//! Queue names end up inside notification channel names and the table name is
//! interpolated into SQL, so both are restricted to a conservative character set.

use crate::constants::limits::{MAX_IDENTIFIER_LENGTH, MAX_MESSAGE_ID_LENGTH};
use crate::error::{BrokerError, Result};

/// Validates a queue name for use in channel names
///
/// Allowed characters are ASCII alphanumerics, `_` and `-`. The length check
/// leaves room for the longest channel suffix and the optional prefix.
pub fn validate_queue_name(queue_name: &str, channel_prefix: Option<&str>) -> Result<()> {
    if queue_name.is_empty() {
        return Err(BrokerError::invalid_queue_name(queue_name, "must not be empty"));
    }

    if let Some(bad) = queue_name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(BrokerError::invalid_queue_name(
            queue_name,
            format!("invalid character {bad:?}"),
        ));
    }

    // "{prefix}.{queue}.enqueue" is the longest channel we build
    let prefix_len = channel_prefix.map_or(0, |p| p.len() + 1);
    let longest = prefix_len + queue_name.len() + ".enqueue".len();
    if longest > MAX_IDENTIFIER_LENGTH {
        return Err(BrokerError::invalid_queue_name(
            queue_name,
            format!("channel name would be {longest} bytes (max: {MAX_IDENTIFIER_LENGTH})"),
        ));
    }

    Ok(())
}

/// Validates a message id
pub fn validate_message_id(message_id: &str) -> Result<()> {
    if message_id.is_empty() {
        return Err(BrokerError::invalid_message_id(message_id, "must not be empty"));
    }

    if message_id.len() > MAX_MESSAGE_ID_LENGTH {
        let truncated: String = message_id.chars().take(16).collect();
        return Err(BrokerError::invalid_message_id(
            format!("{truncated}..."),
            format!(
                "{} bytes (max: {MAX_MESSAGE_ID_LENGTH})",
                message_id.len()
            ),
        ));
    }

    if message_id.chars().any(char::is_control) {
        return Err(BrokerError::invalid_message_id(
            message_id,
            "contains control characters",
        ));
    }

    Ok(())
}

/// Validates a table name that will be interpolated into SQL
pub fn validate_table_name(table_name: &str) -> Result<()> {
    let mut chars = table_name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || table_name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(BrokerError::config(format!(
            "table_name {table_name:?} must match [a-z_][a-z0-9_]* and be at most {MAX_IDENTIFIER_LENGTH} bytes"
        )));
    }

    Ok(())
}

/// Validates a channel prefix
pub fn validate_channel_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || prefix.len() > 20 {
        return Err(BrokerError::config("channels.prefix must be 1-20 characters"));
    }

    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(BrokerError::config(
            "channels.prefix may only contain alphanumerics and underscores",
        ));
    }

    Ok(())
}
