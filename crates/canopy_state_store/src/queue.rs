//! Message transport and its durable SQL implementation.
//!
//! Delivery is at-least-once: a consumed message stays CLAIMED until it is
//! acknowledged, and a claim older than the visibility timeout is handed out
//! again. PENDING messages past their TTL move to `dead_letters`, never vanish.

use std::time::Duration;

use async_trait::async_trait;
use canopy_db::CanopyDb;
use canopy_protocol::{CorrelationId, DispatchMessage, MessageId};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::error::{Result, StateStoreError};
use crate::models::parse_id;

/// A message handed to one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub queue_name: String,
    pub message: DispatchMessage,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// Why a message ended up in the dead-letter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Not consumed before its TTL.
    Ttl,
    /// Rejected by a consumer without requeue.
    Rejected,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::Ttl => "ttl",
            DeadLetterReason::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: i64,
    pub message_id: MessageId,
    pub queue_name: String,
    pub correlation_id: CorrelationId,
    pub reason: String,
    pub dead_lettered_at: i64,
    pub processed_at: Option<i64>,
}

/// Publish/consume with explicit acknowledgement.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue `message`; it is dead-lettered if not consumed within `ttl`.
    async fn publish(&self, queue: &str, message: &DispatchMessage, ttl: Duration) -> Result<MessageId>;

    /// Take the oldest deliverable message, if any.
    async fn consume(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return the message to its queue, or dead-letter it when `requeue` is false.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Dead-letter messages not consumed before their TTL. Returns the count.
    async fn expire_due(&self, now: i64) -> Result<u64>;

    /// Make messages claimed before `now - visibility_timeout` deliverable
    /// again. Returns the count.
    async fn redeliver_stale(&self, visibility_timeout: Duration, now: i64) -> Result<u64>;
}

/// Transport backed by the `dispatch_queue` table of the state database.
#[derive(Clone)]
pub struct SqlTransport {
    pool: SqlitePool,
}

impl SqlTransport {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn publish_at(
        &self,
        queue: &str,
        message: &DispatchMessage,
        ttl: Duration,
        now: i64,
    ) -> Result<MessageId> {
        let message_id = MessageId::new();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO dispatch_queue (message_id, queue_name, correlation_id, payload, enqueued_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message_id.as_str())
        .bind(queue)
        .bind(message.correlation_id.as_str())
        .bind(serde_json::to_string(message)?)
        .bind(now)
        .bind(now.saturating_add(ttl_ms))
        .execute(&self.pool)
        .await?;

        debug!(
            message_id = %message_id,
            queue,
            correlation_id = %message.correlation_id,
            "Published dispatch message"
        );
        Ok(message_id)
    }

    /// Atomically claim the oldest PENDING, unexpired message of `queue`.
    ///
    /// A single conditional UPDATE: two consumers can never claim the same row.
    #[tracing::instrument(name = "db.consume", level = "debug", skip_all, fields(queue = queue))]
    pub async fn consume_at(&self, queue: &str, consumer: &str, now: i64) -> Result<Option<Delivery>> {
        let row = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET status = 'CLAIMED',
                claimed_by = ?,
                claimed_at = ?,
                delivery_count = delivery_count + 1
            WHERE message_id = (
                SELECT message_id FROM dispatch_queue
                WHERE queue_name = ? AND status = 'PENDING' AND expires_at > ?
                ORDER BY enqueued_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'PENDING'
            RETURNING message_id, queue_name, payload, delivery_count
            "#,
        )
        .bind(consumer)
        .bind(now)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_id: String = row.try_get("message_id")?;
        let payload: String = row.try_get("payload")?;
        let delivery_count: i64 = row.try_get("delivery_count")?;
        let delivery = Delivery {
            message_id: MessageId::parse(&message_id)
                .map_err(|e| StateStoreError::corrupt(e.to_string()))?,
            queue_name: row.try_get("queue_name")?,
            message: serde_json::from_str(&payload)?,
            delivery_count: delivery_count.max(0) as u32,
        };

        info!(
            message_id = %delivery.message_id,
            correlation_id = %delivery.message.correlation_id,
            consumer,
            delivery_count = delivery.delivery_count,
            "Claimed dispatch message"
        );
        Ok(Some(delivery))
    }

    /// Drop PENDING messages of a computation.
    ///
    /// Runs on the caller's connection so a cancel can revoke inside its
    /// own transaction. Claimed messages are left to their consumer.
    pub async fn revoke(conn: &mut SqliteConnection, correlation_id: &CorrelationId) -> Result<u64> {
        let revoked = sqlx::query(
            "DELETE FROM dispatch_queue WHERE correlation_id = ? AND status = 'PENDING'",
        )
        .bind(correlation_id.as_str())
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(revoked)
    }

    pub async fn pending_count(&self, queue: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dispatch_queue WHERE queue_name = ? AND status = 'PENDING'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Most recent dead letters, newest first.
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, queue_name, correlation_id, reason, dead_lettered_at, processed_at
            FROM dead_letters
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeadLetter> {
                let message_id: String = row.try_get("message_id")?;
                let correlation_id: String = row.try_get("correlation_id")?;
                Ok(DeadLetter {
                    id: row.try_get("id")?,
                    message_id: MessageId::parse(&message_id)
                        .map_err(|e| StateStoreError::corrupt(e.to_string()))?,
                    queue_name: row.try_get("queue_name")?,
                    correlation_id: parse_id(&correlation_id)?,
                    reason: row.try_get("reason")?,
                    dead_lettered_at: row.try_get("dead_lettered_at")?,
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Transport for SqlTransport {
    async fn publish(&self, queue: &str, message: &DispatchMessage, ttl: Duration) -> Result<MessageId> {
        self.publish_at(queue, message, ttl, CanopyDb::now_millis()).await
    }

    async fn consume(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>> {
        self.consume_at(queue, consumer, CanopyDb::now_millis()).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM dispatch_queue WHERE message_id = ?")
            .bind(delivery.message_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            debug!(message_id = %delivery.message_id, "Ack for message no longer queued");
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        if requeue {
            sqlx::query(
                r#"
                UPDATE dispatch_queue
                SET status = 'PENDING', claimed_by = NULL, claimed_at = NULL
                WHERE message_id = ? AND status = 'CLAIMED'
                "#,
            )
            .bind(delivery.message_id.as_str())
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO dead_letters (message_id, queue_name, correlation_id, payload, reason, dead_lettered_at)
            SELECT message_id, queue_name, correlation_id, payload, ?, ?
            FROM dispatch_queue
            WHERE message_id = ?
            "#,
        )
        .bind(DeadLetterReason::Rejected.as_str())
        .bind(CanopyDb::now_millis())
        .bind(delivery.message_id.as_str())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM dispatch_queue WHERE message_id = ?")
            .bind(delivery.message_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        warn!(message_id = %delivery.message_id, "Rejected dispatch message to dead letters");
        Ok(())
    }

    /// Move PENDING messages whose TTL has passed to the dead-letter table.
    #[tracing::instrument(name = "db.expire_due", level = "debug", skip_all)]
    async fn expire_due(&self, now: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            INSERT INTO dead_letters (message_id, queue_name, correlation_id, payload, reason, dead_lettered_at)
            SELECT message_id, queue_name, correlation_id, payload, ?, ?
            FROM dispatch_queue
            WHERE status = 'PENDING' AND expires_at <= ?
            "#,
        )
        .bind(DeadLetterReason::Ttl.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if moved > 0 {
            sqlx::query("DELETE FROM dispatch_queue WHERE status = 'PENDING' AND expires_at <= ?")
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if moved > 0 {
            warn!(count = moved, "Dead-lettered expired dispatch messages");
        }
        Ok(moved)
    }

    /// Return messages claimed longer than `visibility_timeout` ago to PENDING.
    async fn redeliver_stale(&self, visibility_timeout: Duration, now: i64) -> Result<u64> {
        let cutoff = now.saturating_sub(i64::try_from(visibility_timeout.as_millis()).unwrap_or(i64::MAX));
        let redelivered = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET status = 'PENDING', claimed_by = NULL, claimed_at = NULL
            WHERE status = 'CLAIMED' AND claimed_at <= ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if redelivered > 0 {
            warn!(count = redelivered, "Redelivering unacknowledged dispatch messages");
        }
        Ok(redelivered)
    }
}
