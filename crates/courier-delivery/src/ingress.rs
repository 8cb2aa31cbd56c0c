//! Entry point for new deliveries.

use std::sync::Arc;

use courier_core::{
    models::{Message, NewMessage, OrgId},
    Clock,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    client::{parse_method, parse_url},
    error::{DeliveryError, Result},
    queue::WorkQueue,
    storage::DeliveryStorage,
};

/// Largest payload accepted for delivery.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// A request to deliver one webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Owning organization; its secret signs the delivery.
    pub org_id: OrgId,
    /// HTTP method, any case.
    pub method: String,
    /// Absolute `http` or `https` destination.
    pub url: String,
    /// Body sent verbatim.
    pub payload: Vec<u8>,
}

/// Validates, persists and enqueues new messages.
pub struct Ingress {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn WorkQueue>,
    clock: Arc<dyn Clock>,
}

impl Ingress {
    /// Creates an ingress over the given store and queue.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn WorkQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, queue, clock }
    }

    /// Accepts a message for delivery.
    ///
    /// The message is stored as `pending` and its ID pushed onto the queue.
    /// If the push fails the message is parked in `retry`, due immediately,
    /// so the retry scheduler enqueues it on its next sweep; the call still
    /// succeeds because the message is durable.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidRequest` if the method, URL or payload
    /// is rejected (nothing is stored), or `DeliveryError::DatabaseError` if
    /// the message cannot be stored.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Message> {
        let method = parse_method(&request.method)?;
        let url = parse_url(&request.url)?;
        if request.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(DeliveryError::invalid_request(format!(
                "payload of {} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit",
                request.payload.len()
            )));
        }

        let mut message = self
            .storage
            .create_message(NewMessage {
                org_id: request.org_id,
                method: method.to_string(),
                url: url.to_string(),
                payload: request.payload,
            })
            .await?;

        if let Err(error) = self.queue.push(message.id.to_string()).await {
            warn!(
                message_id = %message.id,
                org_id = %message.org_id,
                error = %error,
                "enqueue failed, deferring message to the retry scheduler"
            );

            let now = self.clock.now_utc();
            message.defer(now, now);
            self.storage.update_message(message.clone()).await?;
            return Ok(message);
        }

        info!(
            message_id = %message.id,
            org_id = %message.org_id,
            method = %message.method,
            "message accepted"
        );
        Ok(message)
    }
}
