//! HTTP client for webhook delivery.
//!
//! Turns a stored message into a request, sends it with a fixed timeout and
//! classifies what came back. Transport failures are outcomes, not errors:
//! the worker records them as attempts and lets the retry policy decide.

use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_core::models::{AttemptResult, Message, MessageId};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::SignedHeaders,
};

/// Methods a message may be delivered with.
pub const SUPPORTED_METHODS: [&str; 7] =
    ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Responses larger than this are truncated before being recorded.
const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

/// Size of the recorded prefix of a truncated response.
const MAX_AUDIT_SIZE: usize = 1024;

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for the whole request, including reading the body.
    pub timeout: Duration,

    /// User agent string for requests.
    pub user_agent: String,

    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "Courier-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// A message ready to go on the wire.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Message being delivered.
    pub message_id: MessageId,
    /// Attempt number this request will be recorded under.
    pub attempt_number: i32,
    /// HTTP method.
    pub method: Method,
    /// Destination.
    pub url: Url,
    /// Raw payload, sent as-is.
    pub body: Bytes,
    /// Signature headers, when the organization has a secret.
    pub signature: Option<SignedHeaders>,
}

impl DeliveryRequest {
    /// Builds an unsigned request from a stored message.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidRequest` if the method or URL is not
    /// deliverable. Such messages can never succeed and are failed without an
    /// attempt.
    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            message_id: message.id,
            attempt_number: message.next_attempt_number(),
            method: parse_method(&message.method)?,
            url: parse_url(&message.url)?,
            body: Bytes::from(message.payload.clone()),
            signature: None,
        })
    }

    /// Attaches signature headers.
    #[must_use]
    pub fn with_signature(mut self, signature: SignedHeaders) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// Parses a method name against [`SUPPORTED_METHODS`], ignoring case.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidRequest` for anything else.
pub fn parse_method(raw: &str) -> Result<Method> {
    let upper = raw.trim().to_ascii_uppercase();
    if !SUPPORTED_METHODS.contains(&upper.as_str()) {
        return Err(DeliveryError::invalid_request(format!("unsupported HTTP method: {raw:?}")));
    }

    Method::from_bytes(upper.as_bytes())
        .map_err(|e| DeliveryError::invalid_request(format!("invalid HTTP method {raw:?}: {e}")))
}

/// Parses an absolute `http` or `https` URL.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidRequest` for relative URLs, other schemes
/// and URLs without a host.
pub fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| DeliveryError::invalid_request(format!("invalid URL {raw:?}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DeliveryError::invalid_request(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(DeliveryError::invalid_request(format!("URL has no host: {raw:?}")));
    }

    Ok(url)
}

/// Classified result of one HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx response.
    Success {
        /// HTTP status code
        status_code: u16,
        /// Response body, when non-empty
        body: Option<String>,
    },
    /// Any other response.
    HttpError {
        /// HTTP status code
        status_code: u16,
        /// Response body, when non-empty
        body: Option<String>,
    },
    /// No response: connect failure, timeout, reset.
    TransportError {
        /// Error description
        message: String,
    },
}

impl AttemptOutcome {
    /// Returns true for [`AttemptOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Status code, when a response was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Success { status_code, .. } | Self::HttpError { status_code, .. } => {
                Some(*status_code)
            },
            Self::TransportError { .. } => None,
        }
    }

    /// Shape stored on the attempt record.
    pub fn to_attempt_result(&self) -> AttemptResult {
        match self {
            Self::Success { status_code, body } | Self::HttpError { status_code, body } => {
                AttemptResult::Response { status_code: *status_code, body: body.clone() }
            },
            Self::TransportError { message } => AttemptResult::Error { message: message.clone() },
        }
    }
}

/// Outcome plus measured wall-clock duration.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// What happened.
    pub outcome: AttemptOutcome,
    /// How long the call took, whatever the outcome.
    pub duration: Duration,
}

impl DeliveryReport {
    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> i64 {
        i64::try_from(self.duration.as_millis()).unwrap_or(i64::MAX)
    }
}

/// HTTP client shared by a worker across deliveries.
///
/// Wraps a single pooled `reqwest::Client`; cloning is cheap.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Sends the request and classifies the result.
    pub async fn deliver(&self, request: &DeliveryRequest) -> DeliveryReport {
        let span = info_span!(
            "webhook_delivery",
            message_id = %request.message_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let start_time = Instant::now();

            let mut http_request = self
                .client
                .request(request.method.clone(), request.url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(request.body.clone());

            if let Some(signature) = &request.signature {
                for (name, value) in signature.to_header_pairs() {
                    http_request = http_request.header(name, value);
                }
            }

            let outcome = match http_request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = read_body(response).await;
                    if status.is_success() {
                        AttemptOutcome::Success { status_code: status.as_u16(), body }
                    } else {
                        AttemptOutcome::HttpError { status_code: status.as_u16(), body }
                    }
                },
                Err(e) => AttemptOutcome::TransportError { message: self.describe_error(&e) },
            };

            let duration = start_time.elapsed();
            match &outcome {
                AttemptOutcome::Success { status_code, .. } => {
                    tracing::debug!(
                        status = status_code,
                        duration_ms = duration.as_millis(),
                        "received success response"
                    );
                },
                AttemptOutcome::HttpError { status_code, .. } => {
                    tracing::warn!(
                        status = status_code,
                        duration_ms = duration.as_millis(),
                        "received error response"
                    );
                },
                AttemptOutcome::TransportError { message } => {
                    tracing::warn!(
                        error = %message,
                        duration_ms = duration.as_millis(),
                        "request failed"
                    );
                },
            }

            DeliveryReport { outcome, duration }
        }
        .instrument(span)
        .await
    }

    fn describe_error(&self, error: &reqwest::Error) -> String {
        if error.is_timeout() {
            DeliveryError::timeout(self.config.timeout.as_secs()).to_string()
        } else if error.is_connect() {
            DeliveryError::network(format!("connection failed: {error}")).to_string()
        } else {
            DeliveryError::network(error.to_string()).to_string()
        }
    }
}

/// Reads a response body for the audit record.
///
/// Stops reading one byte past [`MAX_RESPONSE_BODY_SIZE`], so an endless
/// body costs bounded memory. Empty bodies become `None`. Oversized bodies
/// keep a short prefix.
async fn read_body(mut response: reqwest::Response) -> Option<String> {
    let mut buffer = Vec::new();

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_RESPONSE_BODY_SIZE + 1 - buffer.len();
                buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if buffer.len() > MAX_RESPONSE_BODY_SIZE {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                return Some(format!("[failed to read response body: {e}]"));
            },
        }
    }

    summarize_body(&buffer)
}

/// Text form of a body. NUL bytes are replaced because PostgreSQL `TEXT`
/// cannot store them.
fn summarize_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    let text = if bytes.len() > MAX_RESPONSE_BODY_SIZE {
        let max_content = MAX_AUDIT_SIZE - TRUNCATION_SUFFIX.len();
        format!("{}{TRUNCATION_SUFFIX}", String::from_utf8_lossy(&bytes[..max_content]))
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };

    Some(text.replace('\0', "\u{FFFD}"))
}
