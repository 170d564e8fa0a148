//! Property-based tests for retry timing, routing and the attempt budget.

use std::time::Duration;

use courier_core::DeliveryStatus;
use courier_delivery::{
    matcher::SubscriptionMatcher,
    retry::{calculate_backoff, RetryPolicy},
    transform::filter_fields,
};
use courier_testing::{MockResponse, TestEnv};
use proptest::prelude::*;
use serde_json::{json, Value};

fn payload_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop::collection::btree_map("[a-c]{1,2}", inner, 0..4)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    })
}

proptest! {
    #[test]
    fn backoff_stays_within_jitter_band(
        attempt in 1u32..40,
        base_ms in 1u64..5_000,
        max_secs in 1u64..600,
        jitter in 0.0f64..1.0,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_secs(max_secs);
        let nominal = base.saturating_mul(2u32.saturating_pow((attempt - 1).min(31))).min(max).as_secs_f64();

        let delay = calculate_backoff(attempt, base, max, jitter).as_secs_f64();

        prop_assert!(delay >= nominal * (1.0 - jitter) - 1e-6);
        prop_assert!(delay <= nominal * (1.0 + jitter) + 1e-6);
    }

    #[test]
    fn unjittered_backoff_never_decreases(attempt in 1u32..40, base_ms in 1u64..5_000) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_secs(300);

        prop_assert!(calculate_backoff(attempt + 1, base, max, 0.0) >= calculate_backoff(attempt, base, max, 0.0));
        prop_assert!(calculate_backoff(attempt, base, max, 0.0) <= max);
    }

    #[test]
    fn late_attempts_reuse_last_timeout_tier(attempt in 3u32..1_000) {
        let policy = RetryPolicy::default();
        prop_assert_eq!(policy.timeout_for_attempt(attempt), Duration::from_secs(20));
    }

    #[test]
    fn glob_matches_exactly_its_prefix(prefix in "[a-z]{1,8}", suffix in "[a-z.]{0,12}", other in "[a-z]{1,8}") {
        let matcher = SubscriptionMatcher::new();
        let patterns = vec![format!("{prefix}.*")];

        let matching = format!("{prefix}.{suffix}");
        prop_assert!(matcher.matches_event_type(&patterns, &matching));
        if other != prefix {
            let non_matching = format!("{other}.{suffix}");
            prop_assert!(!matcher.matches_event_type(&patterns, &non_matching));
        }
    }

    #[test]
    fn field_exclusion_is_idempotent(
        payload in payload_strategy(),
        paths in prop::collection::vec("[a-c]{1,2}(\\.[a-c]{1,2}){0,2}", 0..4),
    ) {
        let once = filter_fields(&payload, &paths);
        let twice = filter_fields(&once, &paths);
        prop_assert_eq!(once, twice);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// A delivery makes exactly `failures + 1` attempts when it recovers
    /// within budget, and exactly `max_retries` when it does not.
    #[test]
    fn attempts_never_exceed_budget(max_retries in 1u32..5, failures in 0u32..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnv::new().await.unwrap();
            let mut script: Vec<MockResponse> = (0..failures).map(|_| MockResponse::status(503)).collect();
            script.push(MockResponse::ok());
            env.http_mock.respond_sequence("/hook", script).await;
            let subscription = env.register(env.subscription("/hook").max_retries(max_retries)).await;

            let id = env
                .engine()
                .trigger(subscription.id, "order.created", json!({ "n": failures }), None)
                .await
                .unwrap()
                .delivery_id()
                .unwrap();
            let record = env.run_until_settled(id).await.unwrap();
            let attempts = env.attempts(id).await.unwrap();

            let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
            let expected: Vec<u32> = (1..=record.attempt_count).collect();
            assert_eq!(numbers, expected);

            if failures < max_retries {
                assert_eq!(record.status, DeliveryStatus::Success);
                assert_eq!(record.attempt_count, failures + 1);
                assert!(env.storage.dead_letters().await.is_empty());
            } else {
                assert_eq!(record.status, DeliveryStatus::Failed);
                assert_eq!(record.attempt_count, max_retries);
                assert_eq!(env.storage.dead_letters().await.len(), 1);
            }
        });
    }
}
