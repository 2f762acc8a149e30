#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # pgbroker
//!
//! Transactional message broker on PostgreSQL.
//!
//! ## Overview
//!
//! Messages live in a single table and move through `queued -> consumed -> done`.
//! Producers upsert rows and announce them with `NOTIFY` in the same
//! transaction. Consumers `LISTEN` for those announcements and race for each
//! message with a conditional `UPDATE`; the one update that matches the row wins
//! and every other consumer simply moves on.
//!
//! Notifications are wake-up hints, never the source of truth. A consumer whose
//! poll times out sweeps the table for claimable rows, so lost notifications
//! only cost latency.
//!
//! ## Module Organization
//!
//! - [`broker`] - Entry point owning the backends
//! - [`producer`] - Enqueue, delayed enqueue and enqueue-and-wait
//! - [`consumer`] - Claim protocol state machine and deliveries
//! - [`storage`] - Queue table trait with PostgreSQL and in-memory backends
//! - [`notify`] - Notifier trait with `LISTEN`/`NOTIFY` and in-memory backends
//! - [`reaper`] - Explicit recovery of stale claims
//! - [`messaging`] - Message model, notification payloads and channel naming
//! - [`config`] - Configuration structures and layered loading
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pgbroker::{Broker, BrokerConfig};
//!
//! # async fn example() -> pgbroker::Result<()> {
//! let broker = Broker::connect(BrokerConfig::default()).await?;
//! let mut consumer = broker.consume("jobs").await?;
//!
//! broker.enqueue("jobs", "42", b"hello".to_vec()).await?;
//!
//! while let Some(mut delivery) = consumer.next().await? {
//!     println!("processing {}", delivery.id());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod notify;
pub mod producer;
pub mod reaper;
pub mod storage;
pub mod test_utils;
pub mod validation;

pub use broker::Broker;
pub use config::{BrokerConfig, ConfigLoader};
pub use consumer::{CloseHandle, Consumer, ConsumerState, ConsumerStatsSnapshot, Delivery};
pub use error::{BrokerError, Result};
pub use logging::init_structured_logging;
pub use messaging::{AckOutcome, BrokerEvent, ChannelNames, Message, MessageId, MessageState};
pub use notify::{InMemoryNotifier, Notifier, PgNotifier, PollOutcome, Subscription};
pub use producer::{AckWait, Producer};
pub use reaper::{Reaper, ReaperHandle};
pub use storage::{InMemoryQueueTable, PgQueueTable, QueueDepth, QueueTable};
