//! Property-based tests for message lifecycle invariants.
//!
//! Drives messages through arbitrary sequences of pipeline events and checks
//! the invariants every storage backend relies on.

#![allow(clippy::unwrap_used)]

use chrono::{Duration, TimeZone, Utc};
use courier_core::models::{Message, MessageStatus, NewMessage, OrgId};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

/// Deterministic property test configuration for CI stability.
fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 200, failure_persistence: None, ..ProptestConfig::default() }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Delivered,
    Failed { delay_secs: i64 },
    DeadLettered,
    Requeued,
    Deferred,
}

fn event_strategy() -> impl Strategy<Value = Event> {
    prop_oneof![
        Just(Event::Delivered),
        (1i64..=3600).prop_map(|delay_secs| Event::Failed { delay_secs }),
        Just(Event::DeadLettered),
        Just(Event::Requeued),
        Just(Event::Deferred),
    ]
}

fn fresh_message() -> Message {
    Message::from_new(
        NewMessage {
            org_id: OrgId::new(),
            method: "POST".to_string(),
            url: "https://example.com".to_string(),
            payload: Vec::new(),
        },
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    )
}

proptest! {
    #![proptest_config(proptest_config())]

    /// `next_retry_at` is present exactly when the message is in `retry`, and
    /// the attempt count never goes down.
    #[test]
    fn lifecycle_invariants_hold(events in prop::collection::vec(event_strategy(), 0..40)) {
        let mut message = fresh_message();
        let mut now = message.created_at;

        for event in events {
            if message.status.is_terminal() {
                break;
            }
            let before = message.attempt_count;
            let touched_at = message.updated_at;
            now += Duration::seconds(1);

            // Only the scheduler requeues, and only messages in retry.
            let applied = match event {
                Event::Delivered => {
                    message.mark_delivered(now);
                    true
                },
                Event::Failed { delay_secs } => {
                    message.schedule_retry(now + Duration::seconds(delay_secs), now);
                    true
                },
                Event::DeadLettered => {
                    message.mark_dead_lettered(now);
                    true
                },
                Event::Requeued if message.status == MessageStatus::Retry => {
                    message.set_status(MessageStatus::Pending, now).unwrap();
                    true
                },
                Event::Requeued => false,
                Event::Deferred => {
                    message.defer(now, now);
                    true
                },
            };

            let in_retry = message.status == MessageStatus::Retry;
            prop_assert_eq!(message.next_retry_at.is_some(), in_retry);
            prop_assert!(message.attempt_count >= before);
            prop_assert!(message.attempt_count - before <= 1);
            if applied {
                prop_assert_eq!(message.updated_at, now);
            } else {
                prop_assert_eq!(message.updated_at, touched_at);
            }
        }
    }

    /// A retry is due exactly when its scheduled time has been reached.
    #[test]
    fn retry_due_matches_schedule(delay in 0i64..10_000, elapsed in 0i64..10_000) {
        let mut message = fresh_message();
        let failed_at = message.created_at;
        message.schedule_retry(failed_at + Duration::seconds(delay), failed_at);

        prop_assert_eq!(
            message.is_retry_due(failed_at + Duration::seconds(elapsed)),
            elapsed >= delay
        );
    }
}
