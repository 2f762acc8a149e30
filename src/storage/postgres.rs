//! PostgreSQL queue table
//!
//! All messages live in one table keyed by message id. Enqueue and ack
//! notifications are sent with `pg_notify` inside the same transaction as the
//! state change, so listeners are only woken once the change is committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{QueueDepth, QueueTable};
use crate::config::BrokerConfig;
use crate::constants::storage::{STATE_CONSUMED, STATE_DONE, STATE_QUEUED};
use crate::error::{BrokerError, Result};
use crate::messaging::{AckOutcome, BrokerEvent, ChannelNames, Message, MessageId, MessageState};
use crate::validation::validate_table_name;

/// Row shape of the queue table
#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: String,
    queue_name: String,
    state: String,
    body: Vec<u8>,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = BrokerError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let state = row
            .state
            .parse::<MessageState>()
            .map_err(|e| BrokerError::corrupt_row(&row.id, e))?;

        Ok(Message {
            id: MessageId::new(row.id),
            queue_name: row.queue_name,
            state,
            body: row.body,
            enqueued_at: row.enqueued_at,
            available_at: row.available_at,
            claimed_at: row.claimed_at,
        })
    }
}

/// Queue table stored in PostgreSQL
#[derive(Debug, Clone)]
pub struct PgQueueTable {
    pool: PgPool,
    table_name: String,
    channels: ChannelNames,
    max_payload_size: usize,
}

impl PgQueueTable {
    /// Create a table handle; the table name is validated before use in SQL
    pub fn new(
        pool: PgPool,
        table_name: impl Into<String>,
        channels: ChannelNames,
        max_payload_size: usize,
    ) -> Result<Self> {
        let table_name = table_name.into();
        validate_table_name(&table_name)?;
        Ok(Self {
            pool,
            table_name,
            channels,
            max_payload_size,
        })
    }

    pub fn from_config(pool: PgPool, config: &BrokerConfig) -> Result<Self> {
        Self::new(
            pool,
            config.database.table_name.clone(),
            ChannelNames::from_config(&config.channels),
            config.channels.max_payload_size,
        )
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Create the table and its claim index if they do not exist
    #[instrument(skip(self), fields(table = %self.table_name))]
    pub async fn install_schema(&self) -> Result<()> {
        let table = &self.table_name;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT '{STATE_QUEUED}',
                body BYTEA NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                claimed_at TIMESTAMPTZ,
                acked_at TIMESTAMPTZ
            )"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| BrokerError::storage("install_schema", e))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx
                ON {table} (queue_name, state, available_at)"
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| BrokerError::storage("install_schema", e))?;

        info!("Queue table schema installed: {}", table);
        Ok(())
    }

    async fn notify_in(
        tx: &mut Transaction<'_, Postgres>,
        channel: &str,
        payload: &str,
        operation: &str,
    ) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| BrokerError::storage(operation, e))?;
        Ok(())
    }
}

#[async_trait]
impl QueueTable for PgQueueTable {
    #[instrument(skip(self, message), fields(queue = %message.queue_name, message_id = %message.id))]
    async fn upsert(&self, message: &Message) -> Result<()> {
        let channel = self.channels.enqueue(&message.queue_name);
        let payload = BrokerEvent::enqueued(&message.queue_name, message.id.clone())
            .to_payload(self.max_payload_size)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BrokerError::storage("upsert", e))?;

        sqlx::query(&format!(
            "INSERT INTO {} (id, queue_name, state, body, enqueued_at, available_at, claimed_at, acked_at)
             VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL)
             ON CONFLICT (id) DO UPDATE SET
                queue_name = EXCLUDED.queue_name,
                state = EXCLUDED.state,
                body = EXCLUDED.body,
                enqueued_at = EXCLUDED.enqueued_at,
                available_at = EXCLUDED.available_at,
                claimed_at = NULL,
                acked_at = NULL",
            self.table_name
        ))
        .bind(message.id.as_str())
        .bind(&message.queue_name)
        .bind(STATE_QUEUED)
        .bind(&message.body)
        .bind(message.enqueued_at)
        .bind(message.available_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::storage("upsert", e))?;

        Self::notify_in(&mut tx, &channel, &payload, "upsert").await?;

        tx.commit()
            .await
            .map_err(|e| BrokerError::storage("upsert", e))?;

        debug!("Message upserted and announced on {}", channel);
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %queue_name, message_id = %id))]
    async fn try_claim(&self, queue_name: &str, id: &MessageId) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "UPDATE {} SET state = $3, claimed_at = now()
             WHERE id = $1 AND queue_name = $2 AND state = $4 AND available_at <= now()
             RETURNING id, queue_name, state, body, enqueued_at, available_at, claimed_at",
            self.table_name
        ))
        .bind(id.as_str())
        .bind(queue_name)
        .bind(STATE_CONSUMED)
        .bind(STATE_QUEUED)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BrokerError::storage("try_claim", e))?;

        debug!(won = row.is_some(), "Claim attempt finished");
        row.map(Message::try_from).transpose()
    }

    #[instrument(skip(self), fields(message_id = %id))]
    async fn fetch(&self, id: &MessageId) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT id, queue_name, state, body, enqueued_at, available_at, claimed_at
             FROM {} WHERE id = $1",
            self.table_name
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BrokerError::storage("fetch", e))?;

        row.map(Message::try_from).transpose()
    }

    #[instrument(skip(self), fields(queue = %queue_name, message_id = %id))]
    async fn ack(&self, queue_name: &str, id: &MessageId) -> Result<AckOutcome> {
        let channel = self.channels.ack(queue_name);
        let payload =
            BrokerEvent::acked(queue_name, id.clone()).to_payload(self.max_payload_size)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BrokerError::storage("ack", e))?;

        let result = sqlx::query(&format!(
            "UPDATE {} SET state = $3, acked_at = now()
             WHERE id = $1 AND queue_name = $2 AND state = $4",
            self.table_name
        ))
        .bind(id.as_str())
        .bind(queue_name)
        .bind(STATE_DONE)
        .bind(STATE_CONSUMED)
        .execute(&mut *tx)
        .await
        .map_err(|e| BrokerError::storage("ack", e))?;

        if result.rows_affected() == 1 {
            Self::notify_in(&mut tx, &channel, &payload, "ack").await?;
            tx.commit()
                .await
                .map_err(|e| BrokerError::storage("ack", e))?;
            debug!("Message acknowledged");
            return Ok(AckOutcome::Acked);
        }

        let state: Option<String> = sqlx::query_scalar(&format!(
            "SELECT state FROM {} WHERE id = $1 AND queue_name = $2",
            self.table_name
        ))
        .bind(id.as_str())
        .bind(queue_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| BrokerError::storage("ack", e))?;

        tx.rollback()
            .await
            .map_err(|e| BrokerError::storage("ack", e))?;

        match state.as_deref() {
            Some(STATE_DONE) => Ok(AckOutcome::AlreadyDone),
            other => {
                warn!(state = ?other, "Ack of a message that is not in flight");
                Ok(AckOutcome::NotInFlight)
            }
        }
    }

    #[instrument(skip(self), fields(queue = %queue_name))]
    async fn claimable_ids(&self, queue_name: &str, limit: i64) -> Result<Vec<MessageId>> {
        let ids: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT id FROM {}
             WHERE queue_name = $1 AND state = $2 AND available_at <= now()
             ORDER BY enqueued_at, id
             LIMIT $3",
            self.table_name
        ))
        .bind(queue_name)
        .bind(STATE_QUEUED)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BrokerError::storage("claimable_ids", e))?;

        Ok(ids.into_iter().map(MessageId::new).collect())
    }

    #[instrument(skip(self), fields(queue = %queue_name))]
    async fn requeue_stale(&self, queue_name: &str, older_than: Duration) -> Result<u64> {
        let channel = self.channels.enqueue(queue_name);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BrokerError::storage("requeue_stale", e))?;

        let ids: Vec<String> = sqlx::query_scalar(&format!(
            "UPDATE {} SET state = $2, claimed_at = NULL, available_at = now()
             WHERE queue_name = $1 AND state = $3
               AND claimed_at < now() - make_interval(secs => $4)
             RETURNING id",
            self.table_name
        ))
        .bind(queue_name)
        .bind(STATE_QUEUED)
        .bind(STATE_CONSUMED)
        .bind(older_than.as_secs_f64())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| BrokerError::storage("requeue_stale", e))?;

        for id in &ids {
            let payload = BrokerEvent::enqueued(queue_name, MessageId::new(id.as_str()))
                .to_payload(self.max_payload_size)?;
            Self::notify_in(&mut tx, &channel, &payload, "requeue_stale").await?;
        }

        tx.commit()
            .await
            .map_err(|e| BrokerError::storage("requeue_stale", e))?;

        if !ids.is_empty() {
            info!(count = ids.len(), "Requeued stale messages");
        }
        Ok(ids.len() as u64)
    }

    #[instrument(skip(self), fields(queue = %queue_name))]
    async fn depth(&self, queue_name: &str) -> Result<QueueDepth> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT state, COUNT(*) FROM {} WHERE queue_name = $1 GROUP BY state",
            self.table_name
        ))
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BrokerError::storage("depth", e))?;

        let mut depth = QueueDepth::default();
        for (state, count) in rows {
            let count = count.max(0) as u64;
            match state.parse::<MessageState>() {
                Ok(MessageState::Queued) => depth.queued = count,
                Ok(MessageState::Consumed) => depth.consumed = count,
                Ok(MessageState::Done) => depth.done = count,
                Err(e) => warn!("Ignoring rows with unknown state: {}", e),
            }
        }
        Ok(depth)
    }
}
