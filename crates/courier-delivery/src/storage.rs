//! Storage abstraction for the delivery pipeline.
//!
//! Workers, the scheduler and ingress talk to the message store through
//! [`DeliveryStorage`] so their logic can be exercised against
//! [`mock::MockDeliveryStorage`] without a database. Production wiring wraps
//! the repositories in `courier_core::storage::Storage`.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{
        DeliveryAttempt, Message, MessageId, MessageStatus, NewDeliveryAttempt, NewMessage, OrgId,
    },
};

/// Message store operations used by the pipeline.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Persists a new pending message.
    fn create_message(
        &self,
        message: NewMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>>;

    /// Loads a message. Missing messages are `CoreError::NotFound`.
    fn find_message(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>>;

    /// Sets a message's status and returns the updated message.
    ///
    /// `next_retry_at` is cleared unless the new status is `retry`.
    fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>>;

    /// Writes back status, attempt count and retry due time.
    fn update_message(
        &self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Messages in `retry` due at or before `now`, earliest first.
    fn find_retry_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + '_>>;

    /// Messages in `pending`, oldest first.
    fn find_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + '_>>;

    /// Moves a `retry` message to `pending` if it is still due at
    /// `scheduled_for`. Returns whether the row changed.
    fn requeue_message(
        &self,
        id: MessageId,
        scheduled_for: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Appends an attempt to a message's audit trail.
    fn record_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryAttempt>> + Send + '_>>;

    /// All attempts for a message in attempt order.
    fn find_attempts(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>>;

    /// The organization's signing secret. `CoreError::NotFound` when the
    /// organization is unknown or has no secret configured.
    fn find_signing_secret(
        &self,
        org_id: OrgId,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}

/// PostgreSQL-backed storage.
pub struct PostgresDeliveryStorage {
    storage: Arc<courier_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Wraps the repository container.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn create_message(
        &self,
        message: NewMessage,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.create(message).await })
    }

    fn find_message(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.find_by_id(id).await })
    }

    fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.update_status(id, status).await })
    }

    fn update_message(
        &self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.update(&message).await })
    }

    fn find_retry_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.find_retry_ready(limit, now).await })
    }

    fn find_pending(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.find_pending(limit).await })
    }

    fn requeue_message(
        &self,
        id: MessageId,
        scheduled_for: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.messages.requeue(id, scheduled_for).await })
    }

    fn record_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryAttempt>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.create(attempt).await })
    }

    fn find_attempts(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.find_by_message(id).await })
    }

    fn find_signing_secret(
        &self,
        org_id: OrgId,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.organizations.signing_secret(org_id).await })
    }
}

pub mod mock {
    //! In-memory storage for tests.
    //!
    //! Mirrors the PostgreSQL repositories' semantics, including the
    //! compare-and-set requeue, and lets tests inject failures.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use courier_core::error::{CoreError, Result};
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{
        DeliveryAttempt, DeliveryStorage, Message, MessageId, MessageStatus, NewDeliveryAttempt,
        NewMessage, OrgId,
    };

    /// Mock storage holding messages, attempts and secrets in memory.
    pub struct MockDeliveryStorage {
        messages: Arc<RwLock<HashMap<MessageId, Message>>>,
        attempts: Arc<RwLock<Vec<DeliveryAttempt>>>,
        secrets: Arc<RwLock<HashMap<OrgId, String>>>,
        retry_ready_error: Arc<RwLock<Option<String>>>,
        fail_attempt_writes: AtomicBool,
        fail_message_updates: AtomicBool,
    }

    impl MockDeliveryStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self {
                messages: Arc::new(RwLock::new(HashMap::new())),
                attempts: Arc::new(RwLock::new(Vec::new())),
                secrets: Arc::new(RwLock::new(HashMap::new())),
                retry_ready_error: Arc::new(RwLock::new(None)),
                fail_attempt_writes: AtomicBool::new(false),
                fail_message_updates: AtomicBool::new(false),
            }
        }

        /// Stores a message as-is, replacing any message with the same ID.
        pub async fn insert_message(&self, message: Message) {
            self.messages.write().await.insert(message.id, message);
        }

        /// Configures an organization's signing secret.
        pub async fn add_signing_secret(&self, org_id: OrgId, secret: impl Into<String>) {
            self.secrets.write().await.insert(org_id, secret.into());
        }

        /// Current state of a message.
        pub async fn message(&self, id: MessageId) -> Option<Message> {
            self.messages.read().await.get(&id).cloned()
        }

        /// Every recorded attempt, in insertion order.
        pub async fn recorded_attempts(&self) -> Vec<DeliveryAttempt> {
            self.attempts.read().await.clone()
        }

        /// Fails the next `find_retry_ready` call.
        pub async fn inject_retry_ready_error(&self, error: impl Into<String>) {
            *self.retry_ready_error.write().await = Some(error.into());
        }

        /// Makes attempt writes fail until called with `false`.
        pub fn fail_attempt_writes(&self, fail: bool) {
            self.fail_attempt_writes.store(fail, Ordering::SeqCst);
        }

        /// Makes message updates fail until called with `false`.
        pub fn fail_message_updates(&self, fail: bool) {
            self.fail_message_updates.store(fail, Ordering::SeqCst);
        }

        fn check_updates_allowed(&self) -> Result<()> {
            if self.fail_message_updates.load(Ordering::SeqCst) {
                return Err(CoreError::Database("injected message update failure".to_string()));
            }
            Ok(())
        }
    }

    impl Default for MockDeliveryStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    fn not_found(id: MessageId) -> CoreError {
        CoreError::NotFound(format!("message {id} not found"))
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn create_message(
            &self,
            message: NewMessage,
        ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>> {
            Box::pin(async move {
                let message = Message::from_new(message, Utc::now());
                self.messages.write().await.insert(message.id, message.clone());
                Ok(message)
            })
        }

        fn find_message(
            &self,
            id: MessageId,
        ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>> {
            Box::pin(async move {
                self.messages.read().await.get(&id).cloned().ok_or_else(|| not_found(id))
            })
        }

        fn update_message_status(
            &self,
            id: MessageId,
            status: MessageStatus,
        ) -> Pin<Box<dyn Future<Output = Result<Message>> + Send + '_>> {
            Box::pin(async move {
                self.check_updates_allowed()?;

                let mut messages = self.messages.write().await;
                let message = messages.get_mut(&id).ok_or_else(|| not_found(id))?;
                message.set_status(status, Utc::now())?;
                Ok(message.clone())
            })
        }

        fn update_message(
            &self,
            message: Message,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.check_updates_allowed()?;

                if (message.status == MessageStatus::Retry) != message.next_retry_at.is_some() {
                    return Err(CoreError::ConstraintViolation(format!(
                        "message {} has inconsistent retry state",
                        message.id
                    )));
                }

                let mut messages = self.messages.write().await;
                let stored = messages.get_mut(&message.id).ok_or_else(|| not_found(message.id))?;
                stored.status = message.status;
                stored.attempt_count = message.attempt_count;
                stored.next_retry_at = message.next_retry_at;
                stored.updated_at = message.updated_at;
                Ok(())
            })
        }

        fn find_retry_ready(
            &self,
            limit: usize,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + '_>> {
            Box::pin(async move {
                let error = self.retry_ready_error.write().await.take();
                if let Some(error) = error {
                    return Err(CoreError::Database(error));
                }

                let mut ready: Vec<Message> = self
                    .messages
                    .read()
                    .await
                    .values()
                    .filter(|message| message.is_retry_due(now))
                    .cloned()
                    .collect();
                ready.sort_by_key(|message| message.next_retry_at);
                ready.truncate(limit);
                Ok(ready)
            })
        }

        fn find_pending(
            &self,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Message>>> + Send + '_>> {
            Box::pin(async move {
                let mut pending: Vec<Message> = self
                    .messages
                    .read()
                    .await
                    .values()
                    .filter(|message| message.status == MessageStatus::Pending)
                    .cloned()
                    .collect();
                pending.sort_by_key(|message| message.created_at);
                pending.truncate(limit);
                Ok(pending)
            })
        }

        fn requeue_message(
            &self,
            id: MessageId,
            scheduled_for: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                self.check_updates_allowed()?;

                let mut messages = self.messages.write().await;
                let Some(message) = messages.get_mut(&id) else {
                    return Ok(false);
                };
                if message.status != MessageStatus::Retry
                    || message.next_retry_at != Some(scheduled_for)
                {
                    return Ok(false);
                }

                message.set_status(MessageStatus::Pending, Utc::now())?;
                Ok(true)
            })
        }

        fn record_attempt(
            &self,
            attempt: NewDeliveryAttempt,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryAttempt>> + Send + '_>> {
            Box::pin(async move {
                if self.fail_attempt_writes.load(Ordering::SeqCst) {
                    return Err(CoreError::Database("injected attempt write failure".to_string()));
                }
                // PostgreSQL TEXT columns reject NUL.
                if attempt.response_body().is_some_and(|body| body.contains('\0')) {
                    return Err(CoreError::Database(
                        "invalid byte sequence for encoding \"UTF8\": 0x00".to_string(),
                    ));
                }
                if !self.messages.read().await.contains_key(&attempt.message_id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "attempt references unknown message {}",
                        attempt.message_id
                    )));
                }

                let record = attempt.into_record(Uuid::new_v4());
                self.attempts.write().await.push(record.clone());
                Ok(record)
            })
        }

        fn find_attempts(
            &self,
            id: MessageId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
            Box::pin(async move {
                let mut attempts: Vec<DeliveryAttempt> = self
                    .attempts
                    .read()
                    .await
                    .iter()
                    .filter(|attempt| attempt.message_id == id)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|attempt| attempt.attempt_number);
                Ok(attempts)
            })
        }

        fn find_signing_secret(
            &self,
            org_id: OrgId,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
            Box::pin(async move {
                self.secrets
                    .read()
                    .await
                    .get(&org_id)
                    .filter(|secret| !secret.is_empty())
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::NotFound(format!("no signing secret for organization {org_id}"))
                    })
            })
        }
    }
}
