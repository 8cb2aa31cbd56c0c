//! Signature fixtures a receiver can reproduce independently.

#![allow(clippy::unwrap_used)]

use courier_delivery::signing::{
    sign, verify_signature, HEADER_WEBHOOK_ID, HEADER_WEBHOOK_SIGNATURE, HEADER_WEBHOOK_TIMESTAMP,
};

const WEBHOOK_ID: &str = "msg_2f0c1a8e-6a3c-4c3e-9d7a-0b1e5f7c9d11";
const SECRET: &str = "whsec_test";
const PAYLOAD: &[u8] = br#"{"event":"order.created"}"#;
const TIMESTAMP: i64 = 1_700_000_000;

#[test]
fn known_vectors() {
    let short = sign("abc", "s3cret", b"{}", 1000).unwrap();
    assert_eq!(short.signature, "v1,auI7HWV9tETBmsml8o3w2Pej7dqmodMRqVq+0wIlsGI=");

    let full = sign(WEBHOOK_ID, SECRET, PAYLOAD, TIMESTAMP).unwrap();
    assert_eq!(full.signature, "v1,7n49DczyYy1k+4ZCmY9DdL3/pp0R4U44kDAlRSjCVAM=");
    assert_eq!(full.webhook_id, WEBHOOK_ID);
    assert_eq!(full.timestamp, TIMESTAMP);
}

#[test]
fn header_pairs_carry_all_three_values() {
    let headers = sign(WEBHOOK_ID, SECRET, PAYLOAD, TIMESTAMP).unwrap();

    let pairs = headers.to_header_pairs();
    assert_eq!(pairs[0], (HEADER_WEBHOOK_ID, WEBHOOK_ID.to_string()));
    assert_eq!(pairs[1], (HEADER_WEBHOOK_TIMESTAMP, "1700000000".to_string()));
    assert_eq!(pairs[2], (HEADER_WEBHOOK_SIGNATURE, headers.signature.clone()));
}

#[test]
fn verification_rejects_any_changed_input() {
    let header = sign(WEBHOOK_ID, SECRET, PAYLOAD, TIMESTAMP).unwrap().signature;

    assert!(verify_signature(WEBHOOK_ID, TIMESTAMP, PAYLOAD, SECRET, &header));
    assert!(!verify_signature("msg_other", TIMESTAMP, PAYLOAD, SECRET, &header));
    assert!(!verify_signature(WEBHOOK_ID, TIMESTAMP + 1, PAYLOAD, SECRET, &header));
    assert!(!verify_signature(WEBHOOK_ID, TIMESTAMP, b"{}", SECRET, &header));
    assert!(!verify_signature(WEBHOOK_ID, TIMESTAMP, PAYLOAD, "whsec_other", &header));
}

#[test]
fn verification_accepts_rotated_secret_lists() {
    let old = sign(WEBHOOK_ID, "whsec_old", PAYLOAD, TIMESTAMP).unwrap().signature;
    let new = sign(WEBHOOK_ID, SECRET, PAYLOAD, TIMESTAMP).unwrap().signature;
    let header = format!("{old} {new}");

    assert!(verify_signature(WEBHOOK_ID, TIMESTAMP, PAYLOAD, SECRET, &header));
    assert!(verify_signature(WEBHOOK_ID, TIMESTAMP, PAYLOAD, "whsec_old", &header));
}

#[test]
fn malformed_headers_do_not_verify() {
    let valid = sign(WEBHOOK_ID, SECRET, PAYLOAD, TIMESTAMP).unwrap().signature;
    let encoded = valid.trim_start_matches("v1,");
    let wrong_version = format!("v2,{encoded}");

    for header in ["", "v1", "v1,", "v1,not-base64!", wrong_version.as_str(), encoded] {
        assert!(
            !verify_signature(WEBHOOK_ID, TIMESTAMP, PAYLOAD, SECRET, header),
            "accepted {header:?}"
        );
    }
}
