//! # Broker
//!
//! Owns the storage and notification backends and hands them to producers,
//! consumers and reapers. There is no process-global state: several brokers,
//! even against different databases, can coexist in one process.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{mask_database_url, BrokerConfig};
use crate::consumer::Consumer;
use crate::error::{BrokerError, Result};
use crate::messaging::{ChannelNames, MessageId};
use crate::notify::{InMemoryNotifier, Notifier, PgNotifier};
use crate::producer::Producer;
use crate::reaper::Reaper;
use crate::storage::{InMemoryQueueTable, PgQueueTable, QueueDepth, QueueTable};

/// Entry point tying a queue table to a notifier
#[derive(Debug, Clone)]
pub struct Broker {
    config: BrokerConfig,
    channels: ChannelNames,
    table: Arc<dyn QueueTable>,
    notifier: Arc<dyn Notifier>,
    pool: Option<PgPool>,
}

impl Broker {
    /// Connect to PostgreSQL and install the schema if configured to
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        info!(
            url = %mask_database_url(&config.database.url),
            max_connections = config.database.max_connections,
            "Connecting broker to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(config.database.acquire_timeout())
            .connect(&config.database.url)
            .await
            .map_err(|e| BrokerError::storage("connect", e))?;

        Self::from_pool(pool, config).await
    }

    /// Build a broker on an existing pool
    pub async fn from_pool(pool: PgPool, config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        let table = PgQueueTable::from_config(pool.clone(), &config)?;
        if config.database.install_schema {
            table.install_schema().await?;
        }

        let mut broker = Self::with_backends(
            Arc::new(table),
            Arc::new(PgNotifier::new(pool.clone())),
            config,
        )?;
        broker.pool = Some(pool);
        Ok(broker)
    }

    /// Broker backed by process memory; nothing survives a restart
    pub fn in_memory(config: BrokerConfig) -> Result<Self> {
        let notifier = Arc::new(InMemoryNotifier::new());
        let table = Arc::new(InMemoryQueueTable::new(
            notifier.clone(),
            ChannelNames::from_config(&config.channels),
            config.channels.max_payload_size,
        ));
        Self::with_backends(table, notifier, config)
    }

    /// Broker over caller-supplied backends
    pub fn with_backends(
        table: Arc<dyn QueueTable>,
        notifier: Arc<dyn Notifier>,
        config: BrokerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            channels: ChannelNames::from_config(&config.channels),
            config,
            table,
            notifier,
            pool: None,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    pub fn table(&self) -> Arc<dyn QueueTable> {
        Arc::clone(&self.table)
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::clone(&self.notifier)
    }

    /// The PostgreSQL pool, when connected to a database
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            self.table(),
            self.notifier(),
            self.channels.clone(),
            self.config.consumer.poll_timeout(),
        )
    }

    /// Enqueue a message; an existing id is reset to `queued`
    pub async fn enqueue(
        &self,
        queue_name: &str,
        id: impl Into<MessageId>,
        body: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.producer().enqueue(queue_name, id, body).await?;
        Ok(())
    }

    /// Subscribe a new consumer to `queue_name`
    pub async fn consume(&self, queue_name: &str) -> Result<Consumer> {
        Consumer::subscribe(
            queue_name,
            self.table(),
            self.notifier(),
            &self.channels,
            self.config.consumer.clone(),
        )
        .await
    }

    /// Reaper requeuing claims older than `stale_after`
    pub fn reaper(&self, queue_name: &str, stale_after: Duration) -> Result<Reaper> {
        self.channels.validate_queue(queue_name)?;
        Reaper::new(self.table(), queue_name, stale_after)
    }

    /// Reaper using `reaper.stale_after_secs`; `None` when no threshold is configured
    pub fn configured_reaper(&self, queue_name: &str) -> Result<Option<Reaper>> {
        self.config
            .reaper
            .stale_after()
            .map(|stale_after| self.reaper(queue_name, stale_after))
            .transpose()
    }

    pub async fn depth(&self, queue_name: &str) -> Result<QueueDepth> {
        self.table.depth(queue_name).await
    }

    /// Close the connection pool, if any
    ///
    /// Consumers keep their own subscriptions and should be closed separately.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
            info!("Broker connection pool closed");
        }
    }
}
