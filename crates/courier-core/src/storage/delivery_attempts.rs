//! Repository for delivery attempt database operations.
//!
//! Attempts are an append-only audit trail. Rows are inserted once per HTTP
//! try and never updated or deleted by the pipeline.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryAttempt, MessageId, NewDeliveryAttempt},
};

/// Repository for delivery attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails, including when the parent message is
    /// missing.
    pub async fn create(&self, attempt: NewDeliveryAttempt) -> Result<DeliveryAttempt> {
        let record = attempt.into_record(Uuid::new_v4());

        let stored = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            INSERT INTO delivery_attempts (
                id, message_id, attempt_number, status_code,
                response_body, error_message, duration_ms, attempted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, message_id, attempt_number, status_code,
                      response_body, error_message, duration_ms, attempted_at
            ",
        )
        .bind(record.id)
        .bind(record.message_id)
        .bind(record.attempt_number)
        .bind(record.status_code)
        .bind(&record.response_body)
        .bind(&record.error_message)
        .bind(record.duration_ms)
        .bind(record.attempted_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(stored)
    }

    /// Finds all attempts for a message, in attempt order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_message(&self, message_id: MessageId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, message_id, attempt_number, status_code,
                   response_body, error_message, duration_ms, attempted_at
            FROM delivery_attempts
            WHERE message_id = $1
            ORDER BY attempt_number ASC, attempted_at ASC
            ",
        )
        .bind(message_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Counts attempts recorded for a message.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_message(&self, message_id: MessageId) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM delivery_attempts WHERE message_id = $1")
                .bind(message_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }
}
