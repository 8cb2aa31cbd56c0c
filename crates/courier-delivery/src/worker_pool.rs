//! Supervised background tasks: delivery workers plus the retry scheduler.
//!
//! All tasks share one cancellation token. Shutdown cancels it and joins
//! every handle within a deadline.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::DeliveryClient,
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, Result},
    queue::WorkQueue,
    scheduler::RetryScheduler,
    storage::DeliveryStorage,
    worker::DeliveryWorker,
};

struct TaskHandle {
    label: String,
    handle: JoinHandle<Result<()>>,
}

/// Owns the spawned tasks of a running engine.
pub(crate) struct WorkerPool {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn WorkQueue>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
    handles: Vec<TaskHandle>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn WorkQueue>,
        config: DeliveryConfig,
        client: Arc<DeliveryClient>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            queue,
            config,
            client,
            stats,
            cancellation_token,
            clock,
            handles: Vec::new(),
        }
    }

    /// Spawns `worker_count` delivery workers.
    pub(crate) async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.storage.clone(),
                self.queue.clone(),
                self.config.clone(),
                self.client.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.handles.push(TaskHandle { label: format!("worker-{worker_id}"), handle });
        }
    }

    /// Spawns the single retry scheduler.
    pub(crate) fn spawn_scheduler(&mut self) {
        let scheduler = RetryScheduler::new(
            self.storage.clone(),
            self.queue.clone(),
            self.config.scheduler.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        let handle = tokio::spawn(async move {
            let result = scheduler.run().await;
            if let Err(ref error) = result {
                error!(error = %error, "retry scheduler terminated with error");
            }
            result
        });

        self.handles.push(TaskHandle { label: "scheduler".to_string(), handle });
    }

    /// Cancels all tasks and waits for them to finish.
    ///
    /// Workers finish the delivery they are in before observing
    /// cancellation, so `timeout` should exceed the HTTP timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if tasks are still running
    /// when `timeout` elapses, or `DeliveryError::WorkerPanic` for the first
    /// task that panicked.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            task_count = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.handles);
        let join_all = async {
            let mut first_panic = None;

            for TaskHandle { label, handle } in handles {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(task = %label, error = %error, "task completed with error");
                    },
                    Err(join_error) => {
                        error!(task = %label, error = %join_error, "task panicked");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            task: label,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            self.stats.write().await.active_workers = 0;
            first_panic
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => {
                info!("shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "shutdown timed out, some tasks may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any task is still running.
    pub(crate) fn has_active_tasks(&self) -> bool {
        self.handles.iter().any(|task| !task.handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_tasks() && !self.cancellation_token.is_cancelled() {
            warn!("worker pool dropped without shutdown, cancelling tasks");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::RealClock;

    use super::*;
    use crate::{
        queue::{MemoryWorkQueue, QueueConfig},
        storage::mock::MockDeliveryStorage,
    };

    const POP_TIMEOUT: Duration = Duration::from_millis(200);

    fn pool(worker_count: usize, stats: Arc<RwLock<EngineStats>>) -> WorkerPool {
        let config = DeliveryConfig { worker_count, ..DeliveryConfig::default() };
        let client = Arc::new(DeliveryClient::new(config.client_config.clone()).unwrap());

        WorkerPool::new(
            Arc::new(MockDeliveryStorage::new()),
            Arc::new(MemoryWorkQueue::new(QueueConfig {
                pop_timeout: POP_TIMEOUT,
                ..QueueConfig::default()
            })),
            config,
            client,
            stats,
            CancellationToken::new(),
            Arc::new(RealClock::new()),
        )
    }

    #[tokio::test]
    async fn spawns_workers_and_scheduler() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let mut pool = pool(3, stats.clone());

        pool.spawn_workers().await;
        pool.spawn_scheduler();

        assert_eq!(pool.handles.len(), 4);
        assert_eq!(pool.handles.last().unwrap().label, "scheduler");
        assert_eq!(stats.read().await.active_workers, 3);
        assert!(pool.has_active_tasks());

        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn shutdown_waits_at_most_one_pop_timeout() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let mut pool = pool(2, stats);
        pool.spawn_workers().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < POP_TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn drop_cancels_running_tasks() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let mut pool = pool(1, stats);
        pool.spawn_workers().await;
        let token = pool.cancellation_token.clone();

        drop(pool);

        assert!(token.is_cancelled());
    }
}
