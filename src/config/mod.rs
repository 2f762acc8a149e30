//! # Broker Configuration
//!
//! Configuration structures for the broker. Every section has working defaults so
//! a broker can be built from `BrokerConfig::default()` alone; [`ConfigLoader`]
//! layers files and environment variables on top of those defaults.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pgbroker::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load()?;
//! let timeout = config.consumer.poll_timeout();
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::limits::{DEFAULT_MAX_PAYLOAD_SIZE, NOTIFY_PAYLOAD_HARD_LIMIT};
use crate::constants::storage::DEFAULT_TABLE_NAME;
use crate::error::{BrokerError, Result};
use crate::validation::{validate_channel_prefix, validate_table_name};

pub use loader::{mask_database_url, ConfigLoader};

/// Root broker configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Database connection and storage settings
    pub database: DatabaseConfig,
    /// Notification channel naming and payload limits
    pub channels: ChannelConfig,
    /// Consumer loop tuning
    pub consumer: ConsumerConfig,
    /// Stale claim recovery
    pub reaper: ReaperConfig,
    /// Structured logging
    pub logging: LoggingConfig,
}

impl BrokerConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.channels.validate()?;
        self.consumer.validate()?;
        self.reaper.validate()?;
        Ok(())
    }
}

/// Database connection and storage settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Run the idempotent table bootstrap when connecting
    pub install_schema: bool,
    pub table_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/pgbroker_development".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            install_schema: true,
            table_name: DEFAULT_TABLE_NAME.to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(BrokerError::config("database.url must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(BrokerError::config(
                "database.max_connections must be greater than 0",
            ));
        }
        validate_table_name(&self.table_name)
    }
}

/// Notification channel naming and payload limits
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Optional prefix for all channels, e.g. "prod" gives "prod.jobs.enqueue"
    pub prefix: Option<String>,
    /// Maximum payload size in bytes (pg_notify limit is 8000)
    pub max_payload_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl ChannelConfig {
    /// Set the channels prefix
    pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_payload_size == 0 || self.max_payload_size >= NOTIFY_PAYLOAD_HARD_LIMIT {
            return Err(BrokerError::config(format!(
                "channels.max_payload_size must be between 1 and {}",
                NOTIFY_PAYLOAD_HARD_LIMIT - 1
            )));
        }
        if let Some(ref prefix) = self.prefix {
            validate_channel_prefix(prefix)?;
        }
        Ok(())
    }
}

/// Consumer loop tuning
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// How long a poll blocks before reporting an idle heartbeat
    pub poll_timeout_ms: u64,
    /// Re-subscription attempts after the notification connection drops
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Maximum ids fetched by one heartbeat sweep
    pub sweep_batch_size: i64,
    /// Scan the table for claimable rows on every idle heartbeat
    pub sweep_on_idle: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 5_000,
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
            sweep_batch_size: 100,
            sweep_on_idle: true,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Exponential backoff for the given 1-based reconnect attempt
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(delay)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_timeout_ms == 0 {
            return Err(BrokerError::config(
                "consumer.poll_timeout_ms must be greater than 0",
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(BrokerError::config(
                "consumer.max_reconnect_attempts must be greater than 0",
            ));
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(BrokerError::config(
                "consumer.reconnect_base_delay_ms cannot exceed reconnect_max_delay_ms",
            ));
        }
        if self.sweep_batch_size <= 0 {
            return Err(BrokerError::config(
                "consumer.sweep_batch_size must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Stale claim recovery
///
/// There is no default staleness threshold: how long a claim may legitimately
/// run depends entirely on the workload, so the reaper stays disabled until an
/// operator sets `stale_after_secs`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub stale_after_secs: Option<u64>,
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: None,
            interval_secs: 60,
        }
    }
}

impl ReaperConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(BrokerError::config(
                "reaper.interval_secs must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Structured logging
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
