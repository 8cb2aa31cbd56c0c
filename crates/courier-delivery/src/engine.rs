//! Delivery engine: wires workers and the retry scheduler to a store and a
//! queue and manages their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│ DeliveryWorker×N │──▶│ HTTP Client │
//! └────────────────┘   └──────────────────┘   └─────────────┘
//!        │                 ▲        │
//!        ▼                 │pop     ▼ update
//! ┌────────────────┐   ┌───────┐   ┌───────────────┐
//! │ RetryScheduler │──▶│ Queue │   │ Message Store │
//! └────────────────┘   └───────┘   └───────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, RealClock};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    ingress::Ingress,
    queue::WorkQueue,
    retry::RetryPolicy,
    scheduler::{RetryScheduler, SchedulerConfig},
    storage::DeliveryStorage,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff and retry budget.
    pub retry_policy: RetryPolicy,

    /// Retry scheduler cadence.
    pub scheduler: SchedulerConfig,

    /// Maximum time to wait for tasks to stop on shutdown.
    pub shutdown_timeout: Duration,

    /// Pause after a failed queue pop before the worker tries again.
    pub queue_error_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            queue_error_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running delivery workers.
    pub active_workers: usize,
    /// Messages taken off the queue and delivered or rejected.
    pub messages_processed: u64,
    /// Successful deliveries.
    pub successful_deliveries: u64,
    /// Failed attempts that scheduled a retry.
    pub failed_deliveries: u64,
    /// Messages dead-lettered after exhausting their retries.
    pub dead_lettered: u64,
    /// Messages failed without an attempt because no request could be built.
    pub rejected: u64,
    /// Requests currently on the wire.
    pub in_flight_deliveries: u64,
    /// Retries pushed back onto the queue by the scheduler.
    pub requeued: u64,
}

/// Coordinates the delivery workers and the retry scheduler.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn WorkQueue>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine on the system clock.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn WorkQueue>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        Self::with_clock(storage, queue, config, Arc::new(RealClock::new()))
    }

    /// Creates an engine with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is unusable or the delivery client
    /// cannot be initialized.
    pub fn with_clock(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn WorkQueue>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.scheduler.interval.is_zero() {
            return Err(DeliveryError::configuration("scheduler interval must be non-zero"));
        }
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);

        Ok(Self {
            storage,
            queue,
            config,
            client,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Re-enqueues orphaned `pending` messages, then spawns the workers and
    /// the retry scheduler. A failed recovery is logged and startup goes on.
    ///
    /// Returns immediately. Use [`shutdown`](Self::shutdown) to stop
    /// gracefully; dropping the engine cancels the tasks without waiting.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the engine is already
    /// running or was shut down.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::configuration("delivery engine was cancelled"));
        }

        info!(
            worker_count = self.config.worker_count,
            queue = self.queue.name(),
            max_attempts = self.config.retry_policy.max_attempts,
            "starting webhook delivery engine"
        );

        let recovery = RetryScheduler::new(
            self.storage.clone(),
            self.queue.clone(),
            self.config.scheduler.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        if let Err(error) = recovery.recover_pending().await {
            warn!(error = %error, "pending message recovery failed");
        }

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.queue.clone(),
            self.config.clone(),
            self.client.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );
        worker_pool.spawn_workers().await;
        worker_pool.spawn_scheduler();
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Stops all tasks, letting in-flight deliveries finish.
    ///
    /// # Errors
    ///
    /// Returns error if tasks do not stop within the shutdown timeout or a
    /// task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Whether `start` has been called and tasks are still running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_tasks)
    }

    /// Snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Ingress feeding this engine's store and queue.
    pub fn ingress(&self) -> Ingress {
        Ingress::new(self.storage.clone(), self.queue.clone(), self.clock.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{MemoryWorkQueue, QueueConfig},
        storage::mock::MockDeliveryStorage,
    };

    fn engine(config: DeliveryConfig) -> Result<DeliveryEngine> {
        let queue = MemoryWorkQueue::new(QueueConfig {
            pop_timeout: Duration::from_millis(50),
            ..QueueConfig::default()
        });
        DeliveryEngine::new(Arc::new(MockDeliveryStorage::new()), Arc::new(queue), config)
    }

    #[test]
    fn default_config_matches_documented_constants() {
        let config = DeliveryConfig::default();

        assert_eq!(config.worker_count, 1);
        assert_eq!(config.client_config.timeout, Duration::from_secs(10));
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert_eq!(config.scheduler.interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.batch_size, 10);
    }

    #[test]
    fn zero_scheduler_interval_is_rejected() {
        let mut config = DeliveryConfig::default();
        config.scheduler.interval = Duration::ZERO;

        assert!(matches!(engine(config), Err(DeliveryError::ConfigurationError { .. })));
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let mut engine = engine(DeliveryConfig::default()).unwrap();

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.start().await.is_err());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_no_op() {
        let engine = engine(DeliveryConfig::default()).unwrap();

        assert!(!engine.is_running());
        engine.shutdown().await.unwrap();
    }
}
