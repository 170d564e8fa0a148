//! Property-based tests for delivery invariants that span crates.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use courier_core::{Clock, SigningConfig, Subscription, SubscriptionId, TestClock};
use courier_delivery::{
    circuit::CircuitBreakerManager, shared_store::InMemorySharedStore, transform::PayloadTransformer,
    CircuitConfig, CircuitState,
};
use courier_signing::{SignatureAlgorithm, SignatureService, SigningKey};
use courier_testing::{MockResponse, TestEnv};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use serde_json::{json, Value};

/// Case count from `PROPTEST_CASES`, defaulting low for the async cases.
fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(8);
    ProptestConfig::with_cases(cases)
}

#[derive(Debug, Clone)]
enum CircuitOp {
    Failure,
    Success,
    Advance(u64),
}

fn circuit_op() -> impl Strategy<Value = CircuitOp> {
    prop_oneof![
        3 => Just(CircuitOp::Failure),
        2 => Just(CircuitOp::Success),
        1 => (1u64..90).prop_map(CircuitOp::Advance),
    ]
}

fn json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 5, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,6}", inner, 0..5)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn signatures_round_trip_for_every_algorithm(
        payload in prop::collection::vec(any::<u8>(), 0..2048),
        secret in "[ -~]{1,64}",
        seed in prop::array::uniform32(any::<u8>()),
    ) {
        let service = SignatureService::default();
        let keys = [
            SigningKey::from_secret(SignatureAlgorithm::HmacSha256, &secret).unwrap(),
            SigningKey::from_secret(SignatureAlgorithm::HmacSha512, &secret).unwrap(),
            SigningKey::from_secret(SignatureAlgorithm::Ed25519, &BASE64.encode(seed)).unwrap(),
        ];

        for key in &keys {
            let verification = key.verification_key();
            let signature = service.sign(&payload, key).unwrap();
            prop_assert!(service.verify(&payload, &signature, &verification).unwrap());

            let mut tampered = payload.clone();
            tampered.push(0x2a);
            prop_assert!(!service.verify(&tampered, &signature, &verification).unwrap_or(false));
        }
    }

    #[test]
    fn transformation_without_policy_is_identity(payload in json_strategy()) {
        let transformer = PayloadTransformer::default();
        let subscription = Subscription::new("http://localhost/hook", SigningConfig::hmac_sha256("k"));

        prop_assert_eq!(transformer.apply(&subscription, &payload).unwrap(), payload);
    }

    /// An open circuit always passes through HalfOpen before closing.
    #[test]
    fn circuit_never_moves_from_open_to_closed(ops in prop::collection::vec(circuit_op(), 1..60)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let clock = TestClock::new();
            let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
            let store = Arc::new(InMemorySharedStore::new(clock_arc.clone()));
            let config = CircuitConfig { failure_threshold: 3, reset_timeout: Duration::from_secs(30), success_threshold: 2 };
            let circuit = CircuitBreakerManager::new(config, store, clock_arc);
            let id = SubscriptionId::new();

            let mut previous = circuit.get_status(id).await;
            for op in ops {
                match op {
                    CircuitOp::Failure => circuit.record_failure(id).await,
                    CircuitOp::Success => circuit.record_success(id).await,
                    CircuitOp::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                }
                let current = circuit.get_status(id).await;
                assert!(
                    !(previous == CircuitState::Open && current == CircuitState::Closed),
                    "circuit jumped from Open to Closed after {op:?}"
                );
                assert!(previous == current || previous.can_transition_to(current));
                previous = current;
            }
        });
    }
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Every request carries the attempt number that was persisted for it.
    #[test]
    fn attempt_header_matches_persisted_attempt(failures in 0u32..4) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let env = TestEnv::new().await.unwrap();
            let mut script: Vec<MockResponse> = (0..failures).map(|_| MockResponse::status(502)).collect();
            script.push(MockResponse::ok());
            env.http_mock.respond_sequence("/hook", script).await;
            let subscription = env.register(env.subscription("/hook")).await;

            let id = env
                .engine()
                .trigger(subscription.id, "order.created", json!({ "failures": failures }), None)
                .await
                .unwrap()
                .delivery_id()
                .unwrap();
            env.run_until_settled(id).await.unwrap();

            let sent: Vec<Option<u32>> =
                env.http_mock.received_at("/hook").await.iter().map(|r| r.attempt_number).collect();
            let persisted: Vec<Option<u32>> =
                env.attempts(id).await.unwrap().iter().map(|a| Some(a.attempt_number)).collect();
            assert_eq!(sent, persisted);
            assert_eq!(sent.len() as u32, failures + 1);

            for received in env.http_mock.received_at("/hook").await {
                assert_eq!(received.event_id.as_deref(), Some(id.to_string().as_str()));
            }
        });
    }
}
