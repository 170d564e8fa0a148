#![no_main]

//! Fuzz target for filtering and template rendering on arbitrary JSON.

use courier_core::{FilterSpec, SigningConfig, Subscription};
use courier_delivery::{matcher::matches_filter, transform::PayloadTransformer};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(payload) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    let mut subscription = Subscription::new("http://localhost/hook", SigningConfig::hmac_sha256("k"));
    subscription.excluded_fields = vec!["a".to_string(), "a.b".to_string(), "c.d.e".to_string()];
    subscription.template = Some(r#"{"copy": {{json event}} }"#.to_string());

    let _ = PayloadTransformer::default().apply(&subscription, &payload);

    if let Value::Object(map) = &payload {
        let _ = matches_filter(&FilterSpec::Single(map.clone()), &payload);
    }
});
