//! # Notifier
//!
//! Thin abstraction over a publish/subscribe primitive used to wake idle
//! consumers. Notifications are hints: they may be lost, duplicated or stale,
//! and payloads are never treated as authoritative message data.
//!
//! Two backends are provided:
//!
//! - [`PgNotifier`] - PostgreSQL `LISTEN`/`NOTIFY` through `sqlx::PgListener`
//! - [`InMemoryNotifier`] - process-local hub with failure injection, for tests
//!   and embedded use

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::Result;

pub use memory::{InMemoryNotifier, InMemorySubscription};
pub use postgres::{PgNotifier, PgSubscription};

/// A received notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Result of polling a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// One or more notifications, oldest first
    Notifications(Vec<Notification>),
    /// The timeout elapsed with nothing received; the idle heartbeat
    Idle,
    /// The listening connection dropped and must be re-established
    ConnectionLost,
}

/// Publishes notifications and opens subscriptions
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Open a dedicated connection listening on `channel`
    async fn listen(&self, channel: &str) -> Result<Box<dyn Subscription>>;

    /// Fire-and-forget publish
    async fn notify(&self, channel: &str, payload: &str) -> Result<()>;
}

/// A live subscription to one channel
///
/// Dropping the subscription releases its connection.
#[async_trait]
pub trait Subscription: Send + fmt::Debug {
    fn channel(&self) -> &str;

    /// Wait up to `timeout` for notifications
    async fn poll(&mut self, timeout: Duration) -> Result<PollOutcome>;
}
