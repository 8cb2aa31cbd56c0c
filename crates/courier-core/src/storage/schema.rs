//! Idempotent schema bootstrap.
//!
//! Every statement is `IF NOT EXISTS`, so running it on each start is safe.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "organizations",
        r"
        CREATE TABLE IF NOT EXISTS organizations (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            signing_secret TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "messages",
        r"
        CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY,
            org_id UUID NOT NULL REFERENCES organizations(id),
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            payload BYTEA NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'retry', 'success', 'failed')),
            attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
            next_retry_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK ((status = 'retry') = (next_retry_at IS NOT NULL))
        )
        ",
    ),
    (
        "delivery_attempts",
        r"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            message_id UUID NOT NULL REFERENCES messages(id),
            attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
            status_code INTEGER,
            response_body TEXT,
            error_message TEXT,
            duration_ms BIGINT,
            attempted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK ((status_code IS NULL) <> (error_message IS NULL))
        )
        ",
    ),
    (
        "work_queue",
        r"
        CREATE TABLE IF NOT EXISTS work_queue (
            id BIGSERIAL PRIMARY KEY,
            queue_name TEXT NOT NULL,
            message_id TEXT NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "idx_messages_retry_ready",
        r"
        CREATE INDEX IF NOT EXISTS idx_messages_retry_ready
        ON messages(next_retry_at)
        WHERE status = 'retry'
        ",
    ),
    (
        "idx_messages_org_status",
        r"
        CREATE INDEX IF NOT EXISTS idx_messages_org_status
        ON messages(org_id, status)
        ",
    ),
    (
        "idx_delivery_attempts_message",
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_message
        ON delivery_attempts(message_id, attempt_number)
        ",
    ),
    (
        "idx_work_queue_name",
        r"
        CREATE INDEX IF NOT EXISTS idx_work_queue_name
        ON work_queue(queue_name, id)
        ",
    ),
    (
        "idx_work_queue_message",
        r"
        CREATE INDEX IF NOT EXISTS idx_work_queue_message
        ON work_queue(queue_name, message_id)
        ",
    ),
];

/// Creates the tables and indexes the pipeline needs.
///
/// # Errors
///
/// Returns the first statement that fails.
pub async fn bootstrap(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
        debug!(object = name, "schema object ensured");
    }

    Ok(())
}
