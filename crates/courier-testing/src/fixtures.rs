//! Test data builders.
//!
//! Subscriptions default to an active HMAC-SHA256 endpoint with no filter,
//! template, rate limit or batching.

use courier_core::{BatchConfig, FilterSpec, RateLimitConfig, SigningConfig, Subscription};
use courier_signing::SignatureAlgorithm;
use serde_json::{json, Map, Value};

/// Shared secret used by [`SubscriptionBuilder`] unless overridden.
pub const TEST_SECRET: &str = "whsec_test_secret";

/// Builder for test subscriptions.
pub struct SubscriptionBuilder {
    subscription: Subscription,
}

impl SubscriptionBuilder {
    /// Active subscription posting to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { subscription: Subscription::new(url, SigningConfig::hmac_sha256(TEST_SECRET)) }
    }

    /// HMAC-SHA256 with `secret`.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.subscription.signing = SigningConfig::hmac_sha256(secret);
        self
    }

    /// Arbitrary algorithm and key material.
    #[must_use]
    pub fn signing(mut self, algorithm: SignatureAlgorithm, secret: impl Into<String>) -> Self {
        self.subscription.signing = SigningConfig { algorithm, secret: secret.into() };
        self
    }

    /// Event patterns the subscription matches.
    #[must_use]
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription.event_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Single-map filter; `filter` must be a JSON object.
    #[must_use]
    pub fn filter(mut self, filter: Value) -> Self {
        let map = match filter {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.subscription.filter = Some(FilterSpec::Single(map));
        self
    }

    /// Handlebars payload template.
    #[must_use]
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.subscription.template = Some(template.into());
        self
    }

    /// Dot-paths removed from every payload.
    #[must_use]
    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription.excluded_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Token bucket limit.
    #[must_use]
    pub fn rate_limit(mut self, rate_per_second: f64, burst: u32) -> Self {
        self.subscription.rate_limit = Some(RateLimitConfig { rate_per_second, burst });
        self
    }

    /// Attempt budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.subscription.max_retries = max_retries;
        self
    }

    /// Batching parameters.
    #[must_use]
    pub fn batch(mut self, size: usize, max_wait_ms: u64) -> Self {
        self.subscription.batch = Some(BatchConfig { size, max_wait_ms });
        self
    }

    /// Marks the subscription inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.subscription.is_active = false;
        self
    }

    /// Finishes the subscription.
    pub fn build(self) -> Subscription {
        self.subscription
    }
}

/// Order event payload used across scenarios.
pub fn order_payload(order_id: &str, amount: u64) -> Value {
    json!({
        "order_id": order_id,
        "amount": amount,
        "currency": "USD",
        "customer": { "email": "buyer@example.com", "tier": "gold" }
    })
}
