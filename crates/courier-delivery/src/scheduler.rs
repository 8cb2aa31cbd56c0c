//! Retry scheduler: requeues messages whose backoff has elapsed.
//!
//! Workers never sleep through a backoff. They park failed messages in
//! `retry` with a due time and move on; this sweep pushes due messages back
//! onto the queue on a fixed tick.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DeliveryError, Result},
    queue::WorkQueue,
    storage::DeliveryStorage,
};

/// Sweep cadence and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Time between sweeps.
    pub interval: Duration,

    /// Maximum messages requeued per sweep.
    pub batch_size: usize,

    /// Maximum `pending` messages re-enqueued at startup.
    pub recovery_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(crate::DEFAULT_SCHEDULER_INTERVAL_MS),
            batch_size: crate::DEFAULT_SCHEDULER_BATCH_SIZE,
            recovery_limit: 10_000,
        }
    }
}

/// Periodic sweep over due `retry` messages.
pub struct RetryScheduler {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn WorkQueue>,
    config: SchedulerConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn WorkQueue>,
        config: SchedulerConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, queue, config, stats, cancellation_token, clock }
    }

    /// Sweeps on every tick until cancelled.
    ///
    /// A failed sweep is logged and the next tick tries again.
    ///
    /// # Errors
    ///
    /// Currently never returns an error.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_ms = self.config.interval.as_millis(),
            batch_size = self.config.batch_size,
            "retry scheduler starting"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                _ = ticker.tick() => {},
            }

            if let Err(error) = self.sweep().await {
                error!(error = %error, "retry sweep failed");
            }
        }

        info!("retry scheduler stopped");
        Ok(())
    }

    /// Requeues up to `batch_size` due messages and returns how many moved.
    ///
    /// Each message is pushed before it leaves `retry`. A failed push leaves
    /// it in `retry` for the next sweep. The status change is a
    /// compare-and-set on the due time that was read, so a message a worker
    /// has touched in the meantime is left alone. A message requeued by an
    /// earlier sweep is `pending` and no longer matches.
    ///
    /// # Errors
    ///
    /// Returns error if the due-message query fails. Per-message failures
    /// are logged and skipped.
    pub async fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_utc();
        let due = self
            .storage
            .find_retry_ready(self.config.batch_size, now)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to find due retries: {e}")))?;

        if due.is_empty() {
            return Ok(0);
        }
        debug!(due_count = due.len(), "requeueing due retries");

        let mut requeued = 0;
        for message in due {
            let Some(scheduled_for) = message.next_retry_at else {
                continue;
            };

            if let Err(error) = self.queue.push(message.id.to_string()).await {
                warn!(
                    message_id = %message.id,
                    error = %error,
                    "failed to push due retry, leaving it for the next sweep"
                );
                continue;
            }

            match self.storage.requeue_message(message.id, scheduled_for).await {
                Ok(true) => requeued += 1,
                Ok(false) => debug!(
                    message_id = %message.id,
                    "message changed since it was read, not requeued"
                ),
                Err(error) => warn!(
                    message_id = %message.id,
                    error = %error,
                    "failed to mark requeued message pending"
                ),
            }
        }

        if requeued > 0 {
            self.stats.write().await.requeued += requeued as u64;
            metrics::counter!("webhooks_requeued_total", requeued as u64);
            info!(requeued, "requeued due retries");
        }

        Ok(requeued)
    }

    /// Pushes `pending` messages that have no queue entry, oldest first.
    ///
    /// A pending message without an entry was accepted while the queue was
    /// unavailable or was popped by a worker that stopped before delivering.
    /// Run once before workers start; returns how many were pushed.
    ///
    /// # Errors
    ///
    /// Returns error if the pending query or a queue lookup fails. Push
    /// failures are logged and skipped.
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending = self.storage.find_pending(self.config.recovery_limit).await.map_err(|e| {
            DeliveryError::database(format!("failed to find pending messages: {e}"))
        })?;

        let mut recovered = 0;
        for message in pending {
            let message_id = message.id.to_string();
            if self.queue.contains(&message_id).await? {
                continue;
            }

            match self.queue.push(message_id).await {
                Ok(()) => recovered += 1,
                Err(error) => warn!(
                    message_id = %message.id,
                    error = %error,
                    "failed to re-enqueue pending message"
                ),
            }
        }

        if recovered > 0 {
            metrics::counter!("webhooks_recovered_total", recovered as u64);
            info!(recovered, "re-enqueued pending messages");
        }

        Ok(recovered)
    }
}
