//! Notification channel naming
//!
//! One channel per (queue, event): `{queue}.enqueue` and `{queue}.ack`, with an
//! optional application prefix in front.

use crate::config::ChannelConfig;
use crate::constants::channels::{ACK_SUFFIX, ENQUEUE_SUFFIX};
use crate::error::Result;
use crate::validation::validate_queue_name;

/// Builds channel names for a queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: Option<String>,
}

impl ChannelNames {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.prefix.clone())
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Check that channels built for `queue_name` are valid identifiers
    pub fn validate_queue(&self, queue_name: &str) -> Result<()> {
        validate_queue_name(queue_name, self.prefix())
    }

    /// Channel announcing new messages on a queue
    pub fn enqueue(&self, queue_name: &str) -> String {
        self.build(queue_name, ENQUEUE_SUFFIX)
    }

    /// Channel announcing acknowledgments on a queue
    pub fn ack(&self, queue_name: &str) -> String {
        self.build(queue_name, ACK_SUFFIX)
    }

    fn build(&self, queue_name: &str, suffix: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{queue_name}.{suffix}"),
            None => format!("{queue_name}.{suffix}"),
        }
    }
}
