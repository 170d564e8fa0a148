//! Benchmarks for the delivery hot path.
//!
//! Covers the per-attempt CPU work (signing, routing, transformation,
//! backoff) and a full trigger-to-delivery cycle against a local mock
//! subscriber.

use std::{
    hint::black_box,
    time::{Duration, Instant},
};

use courier_core::{SigningConfig, Subscription};
use courier_delivery::{
    matcher::SubscriptionMatcher,
    retry::calculate_backoff,
    transform::PayloadTransformer,
};
use courier_signing::{SignatureAlgorithm, SignatureService, SigningKey};
use courier_testing::{order_payload, MockResponse, TestEnv};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

const ED25519_SEED: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

fn payload_of_size(size: usize) -> Vec<u8> {
    serde_json::to_vec(&json!({ "data": "x".repeat(size) })).unwrap()
}

/// Signing cost per algorithm and payload size.
fn bench_signing(c: &mut Criterion) {
    let service = SignatureService::default();
    let keys = [
        SigningKey::from_secret(SignatureAlgorithm::HmacSha256, "whsec_bench").unwrap(),
        SigningKey::from_secret(SignatureAlgorithm::HmacSha512, "whsec_bench").unwrap(),
        SigningKey::from_secret(SignatureAlgorithm::Ed25519, ED25519_SEED).unwrap(),
    ];

    let mut group = c.benchmark_group("signing");
    for size in [256, 4_096, 65_536] {
        let payload = payload_of_size(size);
        group.throughput(Throughput::Bytes(payload.len() as u64));

        for key in &keys {
            group.bench_with_input(
                BenchmarkId::new(key.algorithm().as_str(), size),
                &payload,
                |b, payload| b.iter(|| service.signature_header(black_box(payload), key, 1_700_000_000).unwrap()),
            );
        }
    }
    group.finish();
}

/// Routing a single event against many subscriptions.
fn bench_matching(c: &mut Criterion) {
    let matcher = SubscriptionMatcher::new();
    let subscriptions: Vec<Subscription> = (0..1_000)
        .map(|i| {
            let mut subscription = Subscription::new("http://localhost/hook", SigningConfig::hmac_sha256("k"));
            subscription.event_patterns = vec![format!("service{}.*", i % 50)];
            subscription
        })
        .collect();
    let payload = order_payload("o-1", 100);

    c.bench_function("match_1000_subscriptions", |b| {
        b.iter(|| {
            subscriptions
                .iter()
                .filter(|s| matcher.is_match(s, black_box("service7.order.created"), &payload))
                .count()
        });
    });
}

/// Template rendering and field exclusion.
fn bench_transformation(c: &mut Criterion) {
    let transformer = PayloadTransformer::default();
    let mut subscription = Subscription::new("http://localhost/hook", SigningConfig::hmac_sha256("k"));
    subscription.template = Some(r#"{"id": "{{event.order_id}}", "total": {{event.amount}}}"#.to_string());
    subscription.excluded_fields = vec!["customer.email".to_string()];
    let payload = order_payload("o-1", 100);

    c.bench_function("transform_with_template", |b| {
        b.iter(|| transformer.apply(&subscription, black_box(&payload)).unwrap());
    });
}

fn bench_backoff(c: &mut Criterion) {
    c.bench_function("calculate_backoff", |b| {
        b.iter(|| {
            for attempt in 1..=10 {
                black_box(calculate_backoff(attempt, Duration::from_secs(1), Duration::from_secs(300), 0.25));
            }
        });
    });
}

/// Trigger plus one delivery cycle per iteration against a mock subscriber.
fn bench_delivery_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("delivery");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    for batch in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("trigger_and_deliver", batch), &batch, |b, &batch| {
            b.iter_custom(|iters| {
                rt.block_on(async {
                    let env = TestEnv::new().await.unwrap();
                    env.http_mock.respond("/bench", MockResponse::ok()).await;
                    let subscription = env.register(env.subscription("/bench")).await;
                    let payload: Value = order_payload("o-bench", 1);

                    let start = Instant::now();
                    for _ in 0..iters {
                        for _ in 0..batch {
                            env.engine()
                                .trigger(subscription.id, "order.created", payload.clone(), None)
                                .await
                                .unwrap();
                        }
                        env.process_all_pending().await.unwrap();
                    }
                    start.elapsed()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_signing,
    bench_matching,
    bench_transformation,
    bench_backoff,
    bench_delivery_cycle
);
criterion_main!(benches);
