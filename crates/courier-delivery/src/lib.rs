//! Asynchronous webhook delivery pipeline.
//!
//! Messages enter through [`Ingress`], which persists them and pushes their
//! IDs onto a [`WorkQueue`]. [`DeliveryWorker`](worker::DeliveryWorker)s pop
//! IDs, send the signed HTTP request, record the attempt and move the message
//! to `success`, `retry` or `failed`. The [`RetryScheduler`] sweeps the store
//! for `retry` messages whose backoff has elapsed and pushes them back.
//!
//! # Architecture
//!
//! ```text
//! Ingress ──create──▶ message store ◀──update── DeliveryWorker
//!    │                      ▲                        ▲
//!    └──push──▶ WorkQueue ──┼────────pop─────────────┘
//!                  ▲        │
//!                  └─push── RetryScheduler (find due retries, requeue)
//! ```
//!
//! The queue is a handoff, not the source of truth: delivery is
//! at-least-once and receivers deduplicate on `X-Webhook-ID`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::storage::Storage;
//! use courier_delivery::{
//!     queue::{PostgresWorkQueue, QueueConfig},
//!     storage::PostgresDeliveryStorage,
//!     DeliveryConfig, DeliveryEngine, DeliveryError,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let storage = Arc::new(Storage::new(pool));
//! let queue = Arc::new(PostgresWorkQueue::new(storage.pool(), QueueConfig::default()));
//! let delivery_storage = Arc::new(PostgresDeliveryStorage::new(storage));
//!
//! let mut engine = DeliveryEngine::new(delivery_storage, queue, DeliveryConfig::default())?;
//! engine.start().await?;
//!
//! // ... until shutdown is requested
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod ingress;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod signing;
pub mod storage;
pub mod worker;
mod worker_pool;

pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};
pub use ingress::{Ingress, SubmitRequest};
pub use queue::WorkQueue;
pub use retry::RetryPolicy;
pub use scheduler::{RetryScheduler, SchedulerConfig};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default retry budget before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// Default bounded wait of a queue pop, in milliseconds.
pub const DEFAULT_POP_TIMEOUT_MS: u64 = 3_000;

/// Default interval between retry scheduler sweeps, in milliseconds.
pub const DEFAULT_SCHEDULER_INTERVAL_MS: u64 = 5_000;

/// Default number of due retries requeued per sweep.
pub const DEFAULT_SCHEDULER_BATCH_SIZE: usize = 10;
