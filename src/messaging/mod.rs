//! # Messaging Module
//!
//! Message model, notification payloads and channel naming shared by the
//! storage, notifier, producer and consumer layers.

pub mod channels;
pub mod events;
pub mod message;

pub use channels::ChannelNames;
pub use events::{BrokerEvent, MessageEvent};
pub use message::{AckOutcome, Message, MessageId, MessageState};
