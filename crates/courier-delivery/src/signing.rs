//! HMAC-SHA256 signatures for outbound webhooks.
//!
//! The signed content is `"{webhook_id}.{timestamp}.{payload}"` and the
//! signature header value is `v1,<base64 MAC>`. The version tag lets the
//! scheme change later without breaking receivers that only understand v1.
//! Receivers should accept any space-separated entry they can verify, which
//! is what [`verify_signature`] does.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Version tag prefixed to every signature.
pub const SIGNATURE_VERSION: &str = "v1";

/// Header carrying the `msg_`-prefixed message identifier.
pub const HEADER_WEBHOOK_ID: &str = "X-Webhook-ID";

/// Header carrying the Unix timestamp the signature was computed for.
pub const HEADER_WEBHOOK_TIMESTAMP: &str = "X-Webhook-Timestamp";

/// Header carrying the versioned signature.
pub const HEADER_WEBHOOK_SIGNATURE: &str = "X-Webhook-Signature";

/// The three values attached to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Value of `X-Webhook-ID`.
    pub webhook_id: String,
    /// Value of `X-Webhook-Timestamp`, in Unix seconds.
    pub timestamp: i64,
    /// Value of `X-Webhook-Signature`.
    pub signature: String,
}

impl SignedHeaders {
    /// Header name/value pairs in the order they are sent.
    pub fn to_header_pairs(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_WEBHOOK_ID, self.webhook_id.clone()),
            (HEADER_WEBHOOK_TIMESTAMP, self.timestamp.to_string()),
            (HEADER_WEBHOOK_SIGNATURE, self.signature.clone()),
        ]
    }
}

/// Signs a payload.
///
/// Deterministic for fixed inputs; callers that need reproducible output
/// pass the timestamp explicitly.
///
/// # Example
///
/// ```
/// use courier_delivery::signing::sign;
///
/// let headers = sign("abc", "s3cret", b"{}", 1000).unwrap();
/// assert_eq!(headers.signature, "v1,auI7HWV9tETBmsml8o3w2Pej7dqmodMRqVq+0wIlsGI=");
/// ```
///
/// # Errors
///
/// Returns `DeliveryError::ConfigurationError` if the secret cannot key the
/// MAC.
pub fn sign(
    webhook_id: &str,
    secret: &str,
    payload: &[u8],
    timestamp: i64,
) -> Result<SignedHeaders> {
    let mac = compute_mac(webhook_id, secret, payload, timestamp)?;
    let signature = format!("{SIGNATURE_VERSION},{}", BASE64.encode(mac.finalize().into_bytes()));

    Ok(SignedHeaders { webhook_id: webhook_id.to_string(), timestamp, signature })
}

/// Checks a signature header against a payload.
///
/// The header may carry several space-separated signatures (e.g. during a
/// secret rotation); the payload is authentic if any `v1` entry matches.
/// Comparison is constant-time.
pub fn verify_signature(
    webhook_id: &str,
    timestamp: i64,
    payload: &[u8],
    secret: &str,
    header: &str,
) -> bool {
    header.split_whitespace().any(|entry| {
        let Some((version, encoded)) = entry.split_once(',') else {
            return false;
        };
        if version != SIGNATURE_VERSION {
            return false;
        }
        let Ok(expected) = BASE64.decode(encoded) else {
            return false;
        };
        compute_mac(webhook_id, secret, payload, timestamp)
            .is_ok_and(|mac| mac.verify_slice(&expected).is_ok())
    })
}

fn compute_mac(
    webhook_id: &str,
    secret: &str,
    payload: &[u8],
    timestamp: i64,
) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::configuration(format!("invalid signing secret: {e}")))?;

    mac.update(webhook_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_versioned_base64() {
        let headers = sign("msg_1", "secret", b"payload", 1_700_000_000).unwrap();

        let (version, encoded) = headers.signature.split_once(',').unwrap();
        assert_eq!(version, "v1");
        assert_eq!(BASE64.decode(encoded).unwrap().len(), 32);
        assert_eq!(headers.webhook_id, "msg_1");
        assert_eq!(headers.timestamp, 1_700_000_000);
    }

    #[test]
    fn signature_depends_on_every_input() {
        let base = sign("msg_1", "secret", b"payload", 1).unwrap().signature;

        assert_ne!(base, sign("msg_2", "secret", b"payload", 1).unwrap().signature);
        assert_ne!(base, sign("msg_1", "other", b"payload", 1).unwrap().signature);
        assert_ne!(base, sign("msg_1", "secret", b"payloae", 1).unwrap().signature);
        assert_ne!(base, sign("msg_1", "secret", b"payload", 2).unwrap().signature);
    }

    #[test]
    fn verification_accepts_any_matching_entry() {
        let valid = sign("msg_1", "new", b"{}", 5).unwrap().signature;
        let stale = sign("msg_1", "old", b"{}", 5).unwrap().signature;
        let header = format!("v0,ignored {stale} {valid}");

        assert!(verify_signature("msg_1", 5, b"{}", "new", &header));
        assert!(verify_signature("msg_1", 5, b"{}", "old", &header));
        assert!(!verify_signature("msg_1", 6, b"{}", "new", &header));
        assert!(!verify_signature("msg_1", 5, b"{}", "new", "v1,not-base64!"));
        assert!(!verify_signature("msg_1", 5, b"{}", "new", ""));
    }

    #[test]
    fn header_pairs_use_wire_names() {
        let headers = sign("msg_1", "secret", b"{}", 42).unwrap();
        let pairs = headers.to_header_pairs();

        assert_eq!(pairs[0], ("X-Webhook-ID", "msg_1".to_string()));
        assert_eq!(pairs[1], ("X-Webhook-Timestamp", "42".to_string()));
        assert_eq!(pairs[2].0, "X-Webhook-Signature");
    }
}
