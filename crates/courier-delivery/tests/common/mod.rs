//! Shared fixtures: in-memory store and queue, a frozen clock and helpers to
//! build workers and schedulers around them.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{net::TcpListener, sync::Arc, time::Duration};

use courier_core::{
    models::{Message, NewMessage, OrgId},
    Clock, TestClock,
};
use courier_delivery::{
    client::{ClientConfig, DeliveryClient},
    queue::{MemoryWorkQueue, QueueConfig},
    scheduler::{RetryScheduler, SchedulerConfig},
    storage::mock::MockDeliveryStorage,
    worker::DeliveryWorker,
    DeliveryConfig, EngineStats,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 2023-11-14T22:13:20Z
pub const START_UNIX: u64 = 1_700_000_000;

pub const TEST_SECRET: &str = "whsec_test";

pub struct Harness {
    pub storage: Arc<MockDeliveryStorage>,
    pub queue: Arc<MemoryWorkQueue>,
    pub clock: TestClock,
    pub stats: Arc<RwLock<EngineStats>>,
    pub token: CancellationToken,
    pub config: DeliveryConfig,
    pub org_id: OrgId,
}

impl Harness {
    pub fn new() -> Self {
        let config = DeliveryConfig {
            client_config: ClientConfig { timeout: Duration::from_secs(2), ..Default::default() },
            scheduler: SchedulerConfig {
                interval: Duration::from_millis(20),
                ..SchedulerConfig::default()
            },
            ..DeliveryConfig::default()
        };

        Self {
            storage: Arc::new(MockDeliveryStorage::new()),
            queue: Arc::new(MemoryWorkQueue::new(QueueConfig {
                pop_timeout: Duration::from_millis(50),
                ..QueueConfig::default()
            })),
            clock: TestClock::from_unix(START_UNIX),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            token: CancellationToken::new(),
            config,
            org_id: OrgId::new(),
        }
    }

    /// Harness whose organization signs with [`TEST_SECRET`].
    pub async fn with_secret() -> Self {
        let harness = Self::new();
        harness.storage.add_signing_secret(harness.org_id, TEST_SECRET).await;
        harness
    }

    pub fn worker(&self) -> DeliveryWorker {
        DeliveryWorker::new(
            0,
            self.storage.clone(),
            self.queue.clone(),
            self.config.clone(),
            Arc::new(DeliveryClient::new(self.config.client_config.clone()).unwrap()),
            self.stats.clone(),
            self.token.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    pub fn scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(
            self.storage.clone(),
            self.queue.clone(),
            self.config.scheduler.clone(),
            self.stats.clone(),
            self.token.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    /// Stores a pending message for the harness organization.
    pub async fn pending_message(&self, method: &str, url: &str, payload: &[u8]) -> Message {
        let message = Message::from_new(
            NewMessage {
                org_id: self.org_id,
                method: method.to_string(),
                url: url.to_string(),
                payload: payload.to_vec(),
            },
            self.clock.now_utc(),
        );
        self.storage.insert_message(message.clone()).await;
        message
    }

    /// Current stored state of a message.
    pub async fn reload(&self, message: &Message) -> Message {
        self.storage.message(message.id).await.expect("message exists")
    }
}

/// A local URL nothing listens on.
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/hook")
}
