//! In-process work queue.
//!
//! Not durable. Used by tests and single-process deployments that accept
//! losing queued IDs on restart (the scheduler still recovers `retry`
//! messages from the store).

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::sync::{Mutex, Notify};

use super::{QueueConfig, WorkQueue};
use crate::error::{DeliveryError, Result};

/// `VecDeque`-backed queue with a notifier for blocking pops.
#[derive(Debug)]
pub struct MemoryWorkQueue {
    config: QueueConfig,
    entries: Mutex<VecDeque<String>>,
    notify: Notify,
    reject_pushes: AtomicBool,
}

impl MemoryWorkQueue {
    /// Creates an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            reject_pushes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent push fail until called with `false`.
    pub fn reject_pushes(&self, reject: bool) {
        self.reject_pushes.store(reject, Ordering::SeqCst);
    }

    /// Current contents, head first.
    pub async fn snapshot(&self) -> Vec<String> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl WorkQueue for MemoryWorkQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn push(&self, message_id: String) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.reject_pushes.load(Ordering::SeqCst) {
                return Err(DeliveryError::queue(format!(
                    "queue {} is rejecting pushes",
                    self.config.name
                )));
            }

            self.entries.lock().await.push_back(message_id);
            self.notify.notify_one();
            Ok(())
        })
    }

    fn pop(&self) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + '_>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + self.config.pop_timeout;

            loop {
                if let Some(entry) = self.entries.lock().await.pop_front() {
                    return Ok(Some(entry));
                }

                // A push between the check above and this await leaves a
                // permit behind, so the wakeup is not lost.
                if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn len(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        Box::pin(async move { Ok(self.entries.lock().await.len()) })
    }

    fn contains(
        &self,
        message_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let message_id = message_id.to_string();
        Box::pin(async move { Ok(self.entries.lock().await.contains(&message_id)) })
    }
}
