//! # Notification Payloads
//!
//! Events published on the `{queue}.enqueue` and `{queue}.ack` channels. They
//! are wake-up hints only: a consumer never trusts an event over the table, it
//! uses the id to attempt a conditional claim.

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::messaging::message::MessageId;

/// Union of all notification payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// A message became `queued` (new, re-enqueued or requeued)
    Enqueued(MessageEvent),
    /// A message moved to `done`
    Acked(MessageEvent),
}

/// Identifies the message an event refers to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub message_id: MessageId,
    pub queue_name: String,
}

impl BrokerEvent {
    pub fn enqueued(queue_name: impl Into<String>, message_id: MessageId) -> Self {
        Self::Enqueued(MessageEvent {
            message_id,
            queue_name: queue_name.into(),
        })
    }

    pub fn acked(queue_name: impl Into<String>, message_id: MessageId) -> Self {
        Self::Acked(MessageEvent {
            message_id,
            queue_name: queue_name.into(),
        })
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Enqueued(e) | Self::Acked(e) => &e.message_id,
        }
    }

    pub fn queue_name(&self) -> &str {
        match self {
            Self::Enqueued(e) | Self::Acked(e) => &e.queue_name,
        }
    }

    /// Serialize for `pg_notify`, enforcing the payload size limit
    pub fn to_payload(&self, max_payload_size: usize) -> Result<String> {
        let payload = serde_json::to_string(self)?;
        if payload.len() > max_payload_size {
            return Err(BrokerError::PayloadTooLarge {
                size_bytes: payload.len(),
                limit_bytes: max_payload_size,
            });
        }
        Ok(payload)
    }

    pub fn from_payload(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
