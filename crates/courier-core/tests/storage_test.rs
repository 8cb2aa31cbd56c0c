//! Integration tests for the PostgreSQL repositories.
//!
//! These need a reachable database in `DATABASE_URL` and are ignored by
//! default: `cargo test -p courier-core -- --ignored`.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use chrono::{Duration, Utc};
use courier_core::{
    models::{AttemptResult, MessageStatus, NewDeliveryAttempt, NewMessage, OrgId},
    storage::{schema, Storage},
    CoreError,
};
use sqlx::PgPool;

async fn storage() -> Storage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("database reachable");
    schema::bootstrap(&pool).await.expect("schema bootstrap");
    Storage::new(pool)
}

async fn organization(storage: &Storage, secret: Option<&str>) -> OrgId {
    let org_id = OrgId::new();
    sqlx::query("INSERT INTO organizations (id, name, signing_secret) VALUES ($1, $2, $3)")
        .bind(org_id)
        .bind(format!("org-{org_id}"))
        .bind(secret)
        .execute(&*storage.pool())
        .await
        .unwrap();
    org_id
}

fn new_message(org_id: OrgId) -> NewMessage {
    NewMessage {
        org_id,
        method: "POST".to_string(),
        url: "https://receiver.example.com/hook".to_string(),
        payload: b"{}".to_vec(),
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn storage_health_check() {
    let storage = storage().await;
    assert!(storage.health_check().await.is_ok());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn message_round_trip_and_status_update() {
    let storage = storage().await;
    let org_id = organization(&storage, Some("s3cret")).await;

    let created = storage.messages.create(new_message(org_id)).await.unwrap();
    assert_eq!(created.status, MessageStatus::Pending);
    assert_eq!(created.attempt_count, 0);

    let found = storage.messages.find_by_id(created.id).await.unwrap();
    assert_eq!(found.id, created.id);
    assert_eq!(found.payload, b"{}".to_vec());

    let failed = storage.messages.update_status(created.id, MessageStatus::Failed).await.unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
    assert!(failed.next_retry_at.is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn retry_ready_respects_due_time() {
    let storage = storage().await;
    let org_id = organization(&storage, None).await;
    let now = Utc::now();

    let mut due = storage.messages.create(new_message(org_id)).await.unwrap();
    due.schedule_retry(now - Duration::seconds(5), now);
    storage.messages.update(&due).await.unwrap();

    let mut later = storage.messages.create(new_message(org_id)).await.unwrap();
    later.schedule_retry(now + Duration::hours(1), now);
    storage.messages.update(&later).await.unwrap();

    let ready = storage.messages.find_retry_ready(1000, now).await.unwrap();
    assert!(ready.iter().any(|m| m.id == due.id));
    assert!(ready.iter().all(|m| m.id != later.id));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn attempt_rows_reject_ambiguous_outcomes() {
    let storage = storage().await;
    let org_id = organization(&storage, None).await;
    let message = storage.messages.create(new_message(org_id)).await.unwrap();

    storage
        .delivery_attempts
        .create(NewDeliveryAttempt {
            message_id: message.id,
            attempt_number: 1,
            result: AttemptResult::Error { message: "connection refused".to_string() },
            duration_ms: Some(2),
            attempted_at: Utc::now(),
        })
        .await
        .unwrap();

    let ambiguous = sqlx::query(
        "INSERT INTO delivery_attempts (id, message_id, attempt_number) VALUES ($1, $2, 2)",
    )
    .bind(uuid::Uuid::new_v4())
    .bind(message.id)
    .execute(&*storage.pool())
    .await;
    assert!(matches!(CoreError::from(ambiguous.unwrap_err()), CoreError::ConstraintViolation(_)));

    assert_eq!(storage.delivery_attempts.count_by_message(message.id).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn signing_secret_lookup() {
    let storage = storage().await;
    let with_secret = organization(&storage, Some("whsec_test")).await;
    let without_secret = organization(&storage, None).await;

    assert_eq!(storage.organizations.signing_secret(with_secret).await.unwrap(), "whsec_test");
    assert!(storage.organizations.signing_secret(without_secret).await.unwrap_err().is_not_found());
    assert!(storage.organizations.signing_secret(OrgId::new()).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn requeue_only_moves_the_version_it_read() {
    let storage = storage().await;
    let org_id = organization(&storage, None).await;
    let now = Utc::now();

    let mut message = storage.messages.create(new_message(org_id)).await.unwrap();
    message.schedule_retry(now - Duration::seconds(1), now);
    storage.messages.update(&message).await.unwrap();

    // The stored timestamp is truncated to microseconds; compare against it.
    let due_at = storage.messages.find_by_id(message.id).await.unwrap().next_retry_at.unwrap();

    // A stale due time loses the race.
    assert!(!storage.messages.requeue(message.id, due_at - Duration::seconds(1)).await.unwrap());
    assert!(storage.messages.requeue(message.id, due_at).await.unwrap());
    assert!(!storage.messages.requeue(message.id, due_at).await.unwrap());

    let requeued = storage.messages.find_by_id(message.id).await.unwrap();
    assert_eq!(requeued.status, MessageStatus::Pending);
    assert!(requeued.next_retry_at.is_none());
    assert_eq!(requeued.attempt_count, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn pending_lookup_and_status_counts() {
    let storage = storage().await;
    let org_id = organization(&storage, None).await;

    let first = storage.messages.create(new_message(org_id)).await.unwrap();
    let second = storage.messages.create(new_message(org_id)).await.unwrap();
    storage.messages.update_status(second.id, MessageStatus::Success).await.unwrap();

    let pending = storage.messages.find_pending(10_000).await.unwrap();
    assert!(pending.iter().any(|m| m.id == first.id));
    assert!(pending.iter().all(|m| m.id != second.id));

    let counts = storage.messages.count_by_status(org_id).await.unwrap();
    assert_eq!(counts, vec![(MessageStatus::Pending, 1), (MessageStatus::Success, 1)]);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn missing_message_is_not_found() {
    let storage = storage().await;

    let missing = courier_core::MessageId::new();
    assert!(storage.messages.find_by_id(missing).await.unwrap_err().is_not_found());
    assert!(storage
        .messages
        .update_status(missing, MessageStatus::Failed)
        .await
        .unwrap_err()
        .is_not_found());
}
