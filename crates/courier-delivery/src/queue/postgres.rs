//! Work queue stored in the `work_queue` table.
//!
//! Consumers claim the oldest row with `FOR UPDATE SKIP LOCKED` and delete it
//! in the same statement, so concurrent workers never receive the same entry
//! and never block on each other's locks.

use std::{future::Future, pin::Pin, sync::Arc};

use sqlx::PgPool;
use tracing::trace;

use super::{QueueConfig, WorkQueue};
use crate::error::{DeliveryError, Result};

/// Durable queue sharing the message store's connection pool.
pub struct PostgresWorkQueue {
    pool: Arc<PgPool>,
    config: QueueConfig,
}

impl PostgresWorkQueue {
    /// Creates a queue over the `work_queue` table.
    pub fn new(pool: Arc<PgPool>, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    async fn try_pop(&self) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r"
            DELETE FROM work_queue
            WHERE id = (
                SELECT id
                FROM work_queue
                WHERE queue_name = $1
                ORDER BY id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING message_id
            ",
        )
        .bind(&self.config.name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| {
            DeliveryError::queue(format!("failed to pop from {}: {e}", self.config.name))
        })?;

        Ok(row.map(|(message_id,)| message_id))
    }
}

impl WorkQueue for PostgresWorkQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn push(&self, message_id: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("INSERT INTO work_queue (queue_name, message_id) VALUES ($1, $2)")
                .bind(&self.config.name)
                .bind(&message_id)
                .execute(&*self.pool)
                .await
                .map_err(|e| {
                    DeliveryError::queue(format!("failed to push to {}: {e}", self.config.name))
                })?;

            trace!(queue = %self.config.name, message_id = %message_id, "pushed message");
            Ok(())
        })
    }

    fn pop(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + self.config.pop_timeout;

            loop {
                if let Some(message_id) = self.try_pop().await? {
                    return Ok(Some(message_id));
                }

                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
            }
        })
    }

    fn len(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM work_queue WHERE queue_name = $1")
                    .bind(&self.config.name)
                    .fetch_one(&*self.pool)
                    .await
                    .map_err(|e| DeliveryError::queue(format!("failed to count queue: {e}")))?;

            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    fn contains(
        &self,
        message_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let message_id = message_id.to_string();
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                r"
                SELECT EXISTS (
                    SELECT 1 FROM work_queue WHERE queue_name = $1 AND message_id = $2
                )
                ",
            )
            .bind(&self.config.name)
            .bind(&message_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to look up queue entry: {e}")))?;

            Ok(exists)
        })
    }
}
