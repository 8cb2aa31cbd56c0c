//! Delivery worker: pops message IDs and drives one attempt per ID.
//!
//! Per attempt the order is fixed: build request, sign, send, record the
//! attempt, transition the message. The attempt write precedes the status
//! write so a crash in between still leaves an audit trail.

use std::sync::Arc;

use courier_core::{
    models::{Message, MessageId, MessageStatus, NewDeliveryAttempt},
    Clock,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryReport, DeliveryRequest},
    engine::{DeliveryConfig, EngineStats},
    error::{ErrorCategory, Result},
    queue::WorkQueue,
    retry::RetryDecision,
    signing::{self, SignedHeaders},
    storage::DeliveryStorage,
};

/// State change a delivery produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTransition {
    /// 2xx response; the message is `success`.
    Delivered {
        /// Response status code
        status_code: u16,
    },
    /// Failed attempt with budget left; the message is `retry`.
    RetryScheduled {
        /// Attempt count after this attempt
        attempt_count: i32,
        /// When the scheduler may requeue the message
        next_retry_at: chrono::DateTime<chrono::Utc>,
    },
    /// Failed attempt with the budget spent; the message is `failed`.
    DeadLettered {
        /// Attempt count, unchanged by the final attempt
        attempt_count: i32,
    },
    /// The message could not be turned into a request; it is `failed` and no
    /// attempt was recorded.
    Rejected {
        /// Why the request could not be built
        reason: String,
    },
}

/// Individual worker consuming the work queue.
pub struct DeliveryWorker {
    id: usize,
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn WorkQueue>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a new delivery worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn WorkQueue>,
        config: DeliveryConfig,
        client: Arc<DeliveryClient>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, queue, config, client, stats, cancellation_token, clock }
    }

    /// Main worker loop. Pops and processes IDs until cancelled.
    ///
    /// Cancellation is observed between iterations only. A pop that has
    /// started is awaited to its bounded timeout rather than dropped, so an ID
    /// it claims is still delivered; shutdown therefore takes up to one pop
    /// timeout. An attempt that has started runs to completion, including its
    /// store writes.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; per-message failures are logged and
    /// the loop continues.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, queue = self.queue.name(), "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.queue.pop().await {
                Ok(Some(raw_id)) => {
                    let Err(error) = self.process(&raw_id).await else {
                        continue;
                    };

                    let category = ErrorCategory::from(&error);
                    metrics::increment_counter!(
                        "webhook_processing_errors_total",
                        "category" => category.to_string()
                    );
                    error!(
                        worker_id = self.id,
                        message_id = %raw_id,
                        category = %category,
                        error = %error,
                        "message processing failed"
                    );

                    if error.is_retryable() {
                        self.push_back(raw_id).await;
                        tokio::select! {
                            () = self.clock.sleep(self.config.queue_error_backoff) => {}
                            () = self.cancellation_token.cancelled() => break,
                        }
                    }
                },
                Ok(None) => {},
                Err(error) => {
                    warn!(worker_id = self.id, error = %error, "queue pop failed");
                    tokio::select! {
                        () = self.clock.sleep(self.config.queue_error_backoff) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Returns an ID whose processing failed transiently to the queue. A lost
    /// push leaves the message to startup recovery or the retry scheduler.
    async fn push_back(&self, raw_id: String) {
        if let Err(error) = self.queue.push(raw_id.clone()).await {
            warn!(
                worker_id = self.id,
                message_id = %raw_id,
                error = %error,
                "failed to push message back after processing error"
            );
        }
    }

    /// Handles one popped queue entry.
    ///
    /// Malformed IDs, unknown messages and messages already in a terminal
    /// state are skipped and yield `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be loaded or its transition cannot
    /// be persisted.
    pub async fn process(&self, raw_id: &str) -> Result<Option<DeliveryTransition>> {
        let Ok(message_id) = raw_id.parse::<MessageId>() else {
            warn!(worker_id = self.id, raw_id, "skipping malformed message id");
            return Ok(None);
        };

        let message = match self.storage.find_message(message_id).await {
            Ok(message) => message,
            Err(error) if error.is_not_found() => {
                warn!(
                    worker_id = self.id,
                    message_id = %message_id,
                    "message not found, skipping"
                );
                return Ok(None);
            },
            Err(error) => return Err(error.into()),
        };

        if message.status.is_terminal() {
            debug!(
                worker_id = self.id,
                message_id = %message_id,
                status = %message.status,
                "message already terminal, skipping"
            );
            return Ok(None);
        }

        let transition = self.deliver(message).await?;
        self.stats.write().await.messages_processed += 1;

        Ok(Some(transition))
    }

    /// Performs one delivery attempt and transitions the message.
    ///
    /// # Errors
    ///
    /// Returns error if the message's new state cannot be written. Failures
    /// to record the attempt or look up the signing secret are logged only.
    pub async fn deliver(&self, mut message: Message) -> Result<DeliveryTransition> {
        let request = match DeliveryRequest::from_message(&message) {
            Ok(request) => request,
            Err(error) => return self.reject(&message, &error.to_string()).await,
        };
        let request = match self.signature_for(&message).await {
            Some(signature) => request.with_signature(signature),
            None => request,
        };

        debug!(
            worker_id = self.id,
            message_id = %message.id,
            attempt_number = request.attempt_number,
            url = %request.url,
            "attempting webhook delivery"
        );

        self.stats.write().await.in_flight_deliveries += 1;
        let report = self.client.deliver(&request).await;
        self.stats.write().await.in_flight_deliveries -= 1;

        let attempted_at = self.clock.now_utc();
        self.record_attempt(&message, &report, attempted_at).await;

        let transition = if report.outcome.is_success() {
            message.mark_delivered(attempted_at);
            DeliveryTransition::Delivered {
                status_code: report.outcome.status_code().unwrap_or_default(),
            }
        } else {
            let prior_attempts = u32::try_from(message.attempt_count).unwrap_or(0);
            match self.config.retry_policy.decide(prior_attempts, attempted_at) {
                RetryDecision::Retry { next_attempt_at, .. } => {
                    message.schedule_retry(next_attempt_at, attempted_at);
                    DeliveryTransition::RetryScheduled {
                        attempt_count: message.attempt_count,
                        next_retry_at: next_attempt_at,
                    }
                },
                RetryDecision::GiveUp { reason } => {
                    debug!(
                        worker_id = self.id,
                        message_id = %message.id,
                        reason = %reason,
                        "retry budget exhausted"
                    );
                    message.mark_dead_lettered(attempted_at);
                    DeliveryTransition::DeadLettered { attempt_count: message.attempt_count }
                },
            }
        };

        self.storage.update_message(message.clone()).await?;
        self.observe(&message, &report, &transition).await;

        Ok(transition)
    }

    async fn reject(&self, message: &Message, reason: &str) -> Result<DeliveryTransition> {
        warn!(
            worker_id = self.id,
            message_id = %message.id,
            method = %message.method,
            url = %message.url,
            reason = %reason,
            "message cannot be delivered, marking failed"
        );

        self.storage.update_message_status(message.id, MessageStatus::Failed).await?;
        self.stats.write().await.rejected += 1;

        Ok(DeliveryTransition::Rejected { reason: reason.to_string() })
    }

    /// Signs the message if its organization has a secret.
    async fn signature_for(&self, message: &Message) -> Option<SignedHeaders> {
        let secret = match self.storage.find_signing_secret(message.org_id).await {
            Ok(secret) => secret,
            Err(error) => {
                warn!(
                    worker_id = self.id,
                    message_id = %message.id,
                    org_id = %message.org_id,
                    error = %error,
                    "signing secret unavailable, delivering unsigned"
                );
                return None;
            },
        };

        let timestamp = self.clock.unix_timestamp();
        match signing::sign(&message.webhook_id(), &secret, &message.payload, timestamp) {
            Ok(headers) => Some(headers),
            Err(error) => {
                warn!(
                    worker_id = self.id,
                    message_id = %message.id,
                    error = %error,
                    "signing failed, delivering unsigned"
                );
                None
            },
        }
    }

    async fn record_attempt(
        &self,
        message: &Message,
        report: &DeliveryReport,
        attempted_at: chrono::DateTime<chrono::Utc>,
    ) {
        let attempt = NewDeliveryAttempt {
            message_id: message.id,
            attempt_number: message.next_attempt_number(),
            result: report.outcome.to_attempt_result(),
            duration_ms: Some(report.duration_ms()),
            attempted_at,
        };

        if let Err(error) = self.storage.record_attempt(attempt).await {
            error!(
                worker_id = self.id,
                message_id = %message.id,
                attempt_number = message.next_attempt_number(),
                error = %error,
                "failed to record delivery attempt"
            );
        }
    }

    async fn observe(
        &self,
        message: &Message,
        report: &DeliveryReport,
        transition: &DeliveryTransition,
    ) {
        let duration_ms = report.duration_ms();
        #[allow(clippy::cast_precision_loss)]
        let duration = duration_ms as f64;
        metrics::histogram!("webhook_delivery_duration_ms", duration);

        let mut stats = self.stats.write().await;
        match transition {
            DeliveryTransition::Delivered { status_code } => {
                stats.successful_deliveries += 1;
                metrics::increment_counter!("webhooks_delivered_total", "status" => "success");
                info!(
                    worker_id = self.id,
                    message_id = %message.id,
                    org_id = %message.org_id,
                    status_code,
                    duration_ms,
                    "webhook delivered successfully"
                );
            },
            DeliveryTransition::RetryScheduled { attempt_count, next_retry_at } => {
                stats.failed_deliveries += 1;
                metrics::increment_counter!("webhooks_delivered_total", "status" => "failed");
                warn!(
                    worker_id = self.id,
                    message_id = %message.id,
                    org_id = %message.org_id,
                    status_code = report.outcome.status_code(),
                    attempt_count,
                    next_retry_at = %next_retry_at,
                    duration_ms,
                    "delivery failed, retry scheduled"
                );
            },
            DeliveryTransition::DeadLettered { attempt_count } => {
                stats.dead_lettered += 1;
                metrics::increment_counter!("webhooks_delivered_total", "status" => "dead_letter");
                error!(
                    worker_id = self.id,
                    message_id = %message.id,
                    org_id = %message.org_id,
                    status_code = report.outcome.status_code(),
                    attempt_count,
                    duration_ms,
                    "delivery permanently failed"
                );
            },
            DeliveryTransition::Rejected { .. } => {},
        }
    }
}
