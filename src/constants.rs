//! # Broker Constants
//!
//! Channel suffixes, storage defaults and the limits imposed by PostgreSQL
//! LISTEN/NOTIFY that the rest of the crate validates against.

/// Notification channel suffixes, one channel per (queue, event) pair
pub mod channels {
    /// New message alerts: `{queue}.enqueue`
    pub const ENQUEUE_SUFFIX: &str = "enqueue";
    /// Acknowledgment alerts: `{queue}.ack`
    pub const ACK_SUFFIX: &str = "ack";
}

/// PostgreSQL limits
pub mod limits {
    /// `pg_notify` rejects payloads of 8000 bytes or more
    pub const NOTIFY_PAYLOAD_HARD_LIMIT: usize = 8000;
    /// Default payload ceiling, leaving headroom under the hard limit
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 7800;
    /// Identifiers (and so channel names) are truncated past NAMEDATALEN - 1
    pub const MAX_IDENTIFIER_LENGTH: usize = 63;
    /// Message ids travel inside notification payloads
    pub const MAX_MESSAGE_ID_LENGTH: usize = 255;
}

/// Storage defaults
pub mod storage {
    pub const DEFAULT_TABLE_NAME: &str = "broker_messages";
    pub const STATE_QUEUED: &str = "queued";
    pub const STATE_CONSUMED: &str = "consumed";
    pub const STATE_DONE: &str = "done";
}
