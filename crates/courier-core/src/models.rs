//! Core domain models and strongly-typed identifiers.
//!
//! Defines outbound messages, their delivery attempts and the newtype ID
//! wrappers used across the pipeline. Includes database serialization traits
//! and the lifecycle transitions a message goes through between ingress and a
//! terminal state.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed message identifier.
///
/// The string form of this ID is what travels through the work queue; the
/// queue never sees message content.
///
/// # Example
///
/// ```
/// use courier_core::models::MessageId;
/// let id = MessageId::new();
/// let parsed: MessageId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Creates a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for MessageId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed organization identifier.
///
/// Every message belongs to exactly one organization, whose signing secret is
/// used to sign outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgId(pub Uuid);

impl OrgId {
    /// Creates a new random organization ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrgId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OrgId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for OrgId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OrgId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for OrgId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lifecycle state of a message.
///
/// ```text
/// pending ──deliver──▶ success
///    ▲        │
///    │        ├──fail, budget left──▶ retry ──scheduler──▶ pending
///    │        │
///    │        └──fail, budget spent / bad request──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting in the work queue for a worker.
    Pending,
    /// Failed at least once; waiting for `next_retry_at`.
    Retry,
    /// Delivered with a 2xx response. Terminal.
    Success,
    /// Dead-lettered or rejected. Terminal.
    Failed,
}

impl MessageStatus {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Returns true for states no component will move the message out of.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retry" => Ok(Self::Retry),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("unknown message status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for MessageStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let raw = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(raw.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for MessageStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// A single outbound webhook delivery request.
///
/// `next_retry_at` is set if and only if `status` is [`MessageStatus::Retry`].
/// The transition methods below maintain that invariant; storage layers
/// persist whatever the transitions produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Unique identifier, assigned at creation.
    pub id: MessageId,
    /// Owning organization.
    pub org_id: OrgId,
    /// HTTP method used for delivery.
    pub method: String,
    /// Destination URL.
    pub url: String,
    /// Opaque request body.
    pub payload: Vec<u8>,
    /// Current lifecycle state.
    pub status: MessageStatus,
    /// Number of delivery attempts performed.
    pub attempt_count: i32,
    /// When the retry scheduler may re-enqueue this message.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Builds a fresh pending message from an ingress request.
    pub fn from_new(new: NewMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            org_id: new.org_id,
            method: new.method,
            url: new.url,
            payload: new.payload,
            status: MessageStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempt number the next delivery will be recorded under (1-based).
    pub fn next_attempt_number(&self) -> i32 {
        self.attempt_count.saturating_add(1)
    }

    /// Returns true when the scheduler should pick this message up at `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Retry && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Identifier sent to receivers in the `X-Webhook-ID` header.
    pub fn webhook_id(&self) -> String {
        format!("msg_{}", self.id)
    }

    /// Records a successful attempt.
    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.attempt_count = self.next_attempt_number();
        self.status = MessageStatus::Success;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Records a failed attempt that still has retry budget left.
    pub fn schedule_retry(&mut self, next_retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempt_count = self.next_attempt_number();
        self.status = MessageStatus::Retry;
        self.next_retry_at = Some(next_retry_at);
        self.updated_at = now;
    }

    /// Dead-letters the message. The attempt count stays where it was.
    pub fn mark_dead_lettered(&mut self, now: DateTime<Utc>) {
        self.status = MessageStatus::Failed;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Parks the message in `retry` without consuming an attempt.
    ///
    /// Used when the initial enqueue failed so the scheduler picks the message
    /// up on its next sweep.
    pub fn defer(&mut self, due_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = MessageStatus::Retry;
        self.next_retry_at = Some(due_at);
        self.updated_at = now;
    }

    /// Applies a plain status change, keeping `next_retry_at` consistent.
    ///
    /// # Errors
    ///
    /// Moving into `retry` requires a due time; use [`Message::defer`] or
    /// [`Message::schedule_retry`] for that.
    pub fn set_status(
        &mut self,
        status: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if status == MessageStatus::Retry && self.next_retry_at.is_none() {
            return Err(CoreError::ConstraintViolation(format!(
                "message {} cannot enter retry without next_retry_at",
                self.id
            )));
        }
        if status != MessageStatus::Retry {
            self.next_retry_at = None;
        }
        self.status = status;
        self.updated_at = now;
        Ok(())
    }
}

/// Fields supplied by a producer when submitting a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Owning organization.
    pub org_id: OrgId,
    /// HTTP method.
    pub method: String,
    /// Destination URL.
    pub url: String,
    /// Request body.
    pub payload: Vec<u8>,
}

/// What a single delivery attempt produced.
///
/// Either a response came back or the call failed outright, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptResult {
    /// The destination answered with an HTTP status.
    Response {
        /// HTTP status code.
        status_code: u16,
        /// Response body, when non-empty.
        body: Option<String>,
    },
    /// The call never produced a response (connect error, timeout, ...).
    Error {
        /// Transport error description.
        message: String,
    },
}

/// A delivery attempt about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeliveryAttempt {
    /// Message the attempt belongs to.
    pub message_id: MessageId,
    /// 1-based attempt number.
    pub attempt_number: i32,
    /// Outcome of the HTTP call.
    pub result: AttemptResult,
    /// Wall-clock duration of the call.
    pub duration_ms: Option<i64>,
    /// When the attempt completed.
    pub attempted_at: DateTime<Utc>,
}

impl NewDeliveryAttempt {
    /// Status code column value.
    pub fn status_code(&self) -> Option<i32> {
        match &self.result {
            AttemptResult::Response { status_code, .. } => Some(i32::from(*status_code)),
            AttemptResult::Error { .. } => None,
        }
    }

    /// Response body column value.
    pub fn response_body(&self) -> Option<&str> {
        match &self.result {
            AttemptResult::Response { body, .. } => body.as_deref(),
            AttemptResult::Error { .. } => None,
        }
    }

    /// Error message column value.
    pub fn error_message(&self) -> Option<&str> {
        match &self.result {
            AttemptResult::Response { .. } => None,
            AttemptResult::Error { message } => Some(message),
        }
    }

    /// Materializes the stored record under the given ID.
    pub fn into_record(self, id: Uuid) -> DeliveryAttempt {
        DeliveryAttempt {
            id,
            message_id: self.message_id,
            attempt_number: self.attempt_number,
            status_code: self.status_code(),
            response_body: self.response_body().map(str::to_owned),
            error_message: self.error_message().map(str::to_owned),
            duration_ms: self.duration_ms,
            attempted_at: self.attempted_at,
        }
    }
}

/// Immutable audit record of one HTTP delivery try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Record identifier.
    pub id: Uuid,
    /// Parent message.
    pub message_id: MessageId,
    /// 1-based attempt number.
    pub attempt_number: i32,
    /// HTTP status, when a response was received.
    pub status_code: Option<i32>,
    /// Response body, when a non-empty response was received.
    pub response_body: Option<String>,
    /// Transport error, when no response was received.
    pub error_message: Option<String>,
    /// Call duration in milliseconds.
    pub duration_ms: Option<i64>,
    /// When the attempt completed.
    pub attempted_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Exactly one of status code and error message is present.
    pub fn is_well_formed(&self) -> bool {
        self.status_code.is_some() != self.error_message.is_some()
    }

    /// Returns true if the destination answered with a 2xx status.
    pub fn succeeded(&self) -> bool {
        self.status_code.is_some_and(|code| (200..300).contains(&code))
    }
}
