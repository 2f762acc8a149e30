//! # Queue Table
//!
//! Durable storage of messages. The table is the single source of truth for
//! message state; every state change is a conditional update so that two
//! consumers racing for the same row cannot both win.
//!
//! Backends:
//!
//! - [`PgQueueTable`] - a PostgreSQL table, notifying inside the same transaction
//! - [`InMemoryQueueTable`] - a mutex-guarded map with outage injection

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::messaging::{AckOutcome, Message, MessageId};

pub use memory::InMemoryQueueTable;
pub use postgres::PgQueueTable;

/// Message counts per state for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queued: u64,
    pub consumed: u64,
    pub done: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.queued + self.consumed + self.done
    }
}

/// Storage operations used by producers, consumers and the reaper
#[async_trait]
pub trait QueueTable: Send + Sync + fmt::Debug {
    /// Insert a message or reset an existing one to `queued`, then announce it
    /// on the queue's enqueue channel. Both effects happen atomically.
    async fn upsert(&self, message: &Message) -> Result<()>;

    /// Conditionally move a message from `queued` to `consumed`
    ///
    /// The claim and the read of the claimed row are a single statement, so
    /// the winner always leaves with the message. `Some` is returned only to
    /// the single caller whose update matched the row. `None` means the id is
    /// unknown, belongs to another queue, is not yet available, or was already
    /// claimed.
    async fn try_claim(&self, queue_name: &str, id: &MessageId) -> Result<Option<Message>>;

    /// Read a message by id
    async fn fetch(&self, id: &MessageId) -> Result<Option<Message>>;

    /// Move a claimed message to `done` and announce it on the ack channel
    async fn ack(&self, queue_name: &str, id: &MessageId) -> Result<AckOutcome>;

    /// Ids of messages that are claimable right now, oldest first
    async fn claimable_ids(&self, queue_name: &str, limit: i64) -> Result<Vec<MessageId>>;

    /// Return messages claimed longer than `older_than` ago to `queued`
    ///
    /// Each requeued message is announced again. Returns the number requeued.
    async fn requeue_stale(&self, queue_name: &str, older_than: Duration) -> Result<u64>;

    /// Count messages of a queue by state
    async fn depth(&self, queue_name: &str) -> Result<QueueDepth>;
}
