//! Work queue handing message IDs from producers to delivery workers.
//!
//! The queue carries only string-encoded message IDs. It is a handoff, not a
//! source of truth: a lost entry is recovered through the message store and
//! the retry scheduler, and ordering across messages is best-effort.

use std::{future::Future, pin::Pin, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryWorkQueue;
pub use postgres::PostgresWorkQueue;

/// Queue name used when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "main";

/// Named queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Name shared by producers and consumers.
    pub name: String,

    /// Longest a single `pop` blocks before returning `None`.
    pub pop_timeout: Duration,

    /// How often an empty backing store is re-checked during a `pop`.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            pop_timeout: Duration::from_millis(crate::DEFAULT_POP_TIMEOUT_MS),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Durable FIFO handoff between ingress, scheduler and workers.
///
/// `pop` is atomic: an entry is handed to exactly one consumer.
pub trait WorkQueue: Send + Sync + 'static {
    /// Queue name.
    fn name(&self) -> &str;

    /// Appends a message ID to the tail.
    fn push(&self, message_id: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Removes the head entry, waiting up to the configured pop timeout.
    ///
    /// `Ok(None)` means the wait elapsed with nothing to hand out; it is not
    /// an error.
    fn pop(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>>;

    /// Number of entries waiting.
    fn len(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>;

    /// Whether the message ID is waiting in the queue.
    fn contains(&self, message_id: &str)
        -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;
}
