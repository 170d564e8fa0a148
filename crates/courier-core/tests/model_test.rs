//! Invariants of the delivery record model that every storage backend
//! relies on.

use chrono::{Duration, TimeZone, Utc};
use courier_core::{
    DeadLetterEntry, DeliveryRecord, DeliveryStatus, DeliveryTransition, PayloadSnapshot,
    SubscriptionId,
};
use proptest::prelude::*;
use serde_json::json;

fn transition_strategy() -> impl Strategy<Value = DeliveryTransition> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    prop_oneof![
        Just(DeliveryTransition::Succeeded),
        (0i64..86_400, "[a-z ]{1,20}").prop_map(move |(secs, error)| DeliveryTransition::Retry {
            next_retry_at: base + Duration::seconds(secs),
            error,
        }),
        "[a-z ]{1,20}".prop_map(|error| DeliveryTransition::Failed { error }),
    ]
}

proptest! {
    #[test]
    fn next_retry_at_is_set_iff_pending(transition in transition_strategy()) {
        let pending = transition.status() == DeliveryStatus::Pending;
        prop_assert_eq!(transition.next_retry_at().is_some(), pending);
        prop_assert_eq!(transition.status().is_terminal(), !pending);
    }

    #[test]
    fn payload_snapshot_preserves_arbitrary_documents(
        key in "[a-z]{1,8}",
        value in any::<i64>(),
        nested in prop::collection::vec(any::<bool>(), 0..8),
    ) {
        let mut data = json!({ "nested": nested });
        data[key.as_str()] = json!(value);
        let snapshot = PayloadSnapshot::new(data.clone());

        let decoded: PayloadSnapshot =
            serde_json::from_slice(&serde_json::to_vec(&snapshot).unwrap()).unwrap();

        prop_assert_eq!(decoded.data(), &data);
        prop_assert_eq!(serde_json::from_slice::<serde_json::Value>(&snapshot.to_body().unwrap()).unwrap(), data);
    }
}

#[test]
fn dead_letter_retry_count_matches_attempts_made() {
    let now = Utc::now();
    let mut record = DeliveryRecord::pending(
        SubscriptionId::new(),
        "order.created",
        PayloadSnapshot::new(json!({"id": 1})),
        None,
        now,
    );
    record.attempt_count = 5;
    record.status = DeliveryStatus::Failed;
    record.next_retry_at = None;

    let entry = DeadLetterEntry::from_delivery(&record, "HTTP 503", now);

    assert_eq!(entry.retry_count, 5);
    assert_eq!(entry.event_type, "order.created");
    assert_eq!(entry.error, "HTTP 503");
}

#[test]
fn unknown_snapshot_schema_is_rejected() {
    let result = serde_json::from_value::<PayloadSnapshot>(json!({"schema": "v9", "data": {}}));
    assert!(result.is_err());
}
