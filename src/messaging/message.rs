//! # Message Model
//!
//! The immutable value object stored in the queue table, its identifier and its
//! lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::storage::{STATE_CONSUMED, STATE_DONE, STATE_QUEUED};
use crate::error::{BrokerError, Result};

/// Globally unique message identifier
///
/// Any string is accepted so callers can use their own idempotency keys;
/// [`MessageId::generate`] produces a UUID v4 when they have none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random UUID v4 identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Message lifecycle state
///
/// Transitions are monotonic `Queued -> Consumed -> Done`. Only an explicit
/// requeue (upsert or reaper) moves a message back to `Queued`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Waiting to be claimed
    #[default]
    Queued,
    /// Claimed by exactly one consumer
    Consumed,
    /// Acknowledged by the consumer that claimed it
    Done,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => STATE_QUEUED,
            Self::Consumed => STATE_CONSUMED,
            Self::Done => STATE_DONE,
        }
    }

    /// Check if a consumer currently holds the message
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Consumed)
    }

    /// Check whether the protocol allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: MessageState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Consumed) | (Self::Consumed, Self::Done)
        )
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            STATE_QUEUED => Ok(Self::Queued),
            STATE_CONSUMED => Ok(Self::Consumed),
            STATE_DONE => Ok(Self::Done),
            _ => Err(format!("Invalid message state: {s}")),
        }
    }
}

/// One unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub queue_name: String,
    pub state: MessageState,
    /// Opaque payload owned by the application
    pub body: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the message may be claimed
    pub available_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Build a new message in the `Queued` state, claimable immediately
    pub fn queued(
        queue_name: impl Into<String>,
        id: impl Into<MessageId>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            state: MessageState::Queued,
            body: body.into(),
            enqueued_at: now,
            available_at: now,
            claimed_at: None,
        }
    }

    /// Build a new message in the `Queued` state that becomes claimable after `delay`
    ///
    /// Fails with [`BrokerError::InvalidDelay`] when `now + delay` is not a
    /// representable timestamp.
    pub fn delayed(
        queue_name: impl Into<String>,
        id: impl Into<MessageId>,
        body: impl Into<Vec<u8>>,
        delay: Duration,
    ) -> Result<Self> {
        let mut message = Self::queued(queue_name, id, body);
        let offset = chrono::Duration::from_std(delay)
            .map_err(|e| BrokerError::InvalidDelay {
                delay,
                reason: e.to_string(),
            })?;
        message.available_at = message
            .enqueued_at
            .checked_add_signed(offset)
            .ok_or_else(|| BrokerError::InvalidDelay {
                delay,
                reason: "availability time is out of range".to_string(),
            })?;
        Ok(message)
    }

    /// Body as UTF-8 text, if it is valid UTF-8
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Whether the message may be claimed at `now`
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }
}

/// Result of acknowledging a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// The message moved from `Consumed` to `Done`
    Acked,
    /// The message was already `Done`; nothing changed
    AlreadyDone,
    /// The message is missing or not currently claimed (e.g. requeued meanwhile)
    NotInFlight,
}

impl AckOutcome {
    /// True when the message is `Done` after the call
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Acked | Self::AlreadyDone)
    }
}
