//! Repository for message rows.
//!
//! Messages are the source of truth for the pipeline: the work queue only
//! carries IDs, so every state change a worker or the scheduler makes lands
//! here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Message, MessageId, MessageStatus, NewMessage, OrgId},
};

const MESSAGE_COLUMNS: &str = "id, org_id, method, url, payload, status, attempt_count, \
                               next_retry_at, created_at, updated_at";

/// Repository for message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a pending message with a fresh ID and zero attempts.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the organization does not exist.
    pub async fn create(&self, new: NewMessage) -> Result<Message> {
        let message = Message::from_new(new, Utc::now());

        let sql = format!(
            r"
            INSERT INTO messages (
                id, org_id, method, url, payload, status, attempt_count,
                next_retry_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {MESSAGE_COLUMNS}
            "
        );

        let created = sqlx::query_as::<_, Message>(&sql)
            .bind(message.id)
            .bind(message.org_id)
            .bind(&message.method)
            .bind(&message.url)
            .bind(&message.payload)
            .bind(message.status)
            .bind(message.attempt_count)
            .bind(message.next_retry_at)
            .bind(message.created_at)
            .bind(message.updated_at)
            .fetch_one(&*self.pool)
            .await?;

        Ok(created)
    }

    /// Finds a message by ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no such message exists.
    pub async fn find_by_id(&self, id: MessageId) -> Result<Message> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");

        sqlx::query_as::<_, Message>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {id} not found")))
    }

    /// Sets the status of a message and returns the updated row.
    ///
    /// `next_retry_at` is cleared for every status except `retry`, which
    /// keeps whatever due time the row already carries.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no such message exists, or a
    /// constraint violation when entering `retry` without a due time.
    pub async fn update_status(&self, id: MessageId, status: MessageStatus) -> Result<Message> {
        let sql = format!(
            r"
            UPDATE messages
            SET status = $2,
                next_retry_at = CASE WHEN $2 = 'retry' THEN next_retry_at ELSE NULL END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "
        );

        sqlx::query_as::<_, Message>(&sql)
            .bind(id)
            .bind(status)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {id} not found")))
    }

    /// Persists the mutable fields of a message.
    ///
    /// Writes status, attempt count, retry due time and update timestamp;
    /// identity, destination and payload never change after creation.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the message does not exist.
    pub async fn update(&self, message: &Message) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET status = $2,
                attempt_count = $3,
                next_retry_at = $4,
                updated_at = $5
            WHERE id = $1
            ",
        )
        .bind(message.id)
        .bind(message.status)
        .bind(message.attempt_count)
        .bind(message.next_retry_at)
        .bind(message.updated_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("message {} not found", message.id)));
        }

        Ok(())
    }

    /// Finds messages in `retry` whose due time has passed, earliest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_retry_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            r"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE status = 'retry'
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            "
        );

        let messages = sqlx::query_as::<_, Message>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(messages)
    }

    /// Moves a due `retry` message back to `pending`.
    ///
    /// Compare-and-set on the due time the caller read: returns `false`
    /// without writing if the row has since left `retry` or been rescheduled,
    /// so a worker's concurrent transition is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue(&self, id: MessageId, scheduled_for: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE messages
            SET status = 'pending',
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'retry'
              AND next_retry_at = $2
            ",
        )
        .bind(id)
        .bind(scheduled_for)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds pending messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_pending(&self, limit: usize) -> Result<Vec<Message>> {
        let sql = format!(
            r"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "
        );

        let messages = sqlx::query_as::<_, Message>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(messages)
    }

    /// Counts an organization's messages per status.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_status(&self, org_id: OrgId) -> Result<Vec<(MessageStatus, i64)>> {
        let counts = sqlx::query_as::<_, (MessageStatus, i64)>(
            r"
            SELECT status, COUNT(*)
            FROM messages
            WHERE org_id = $1
            GROUP BY status
            ORDER BY status
            ",
        )
        .bind(org_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(counts)
    }
}
