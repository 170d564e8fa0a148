//! Per-subscription payload reshaping.
//!
//! Excluded fields are removed first, then an optional template renders the
//! filtered payload into the body the subscriber receives. Templates see the
//! payload as `event` and must produce JSON.

use std::{fmt::Debug, sync::Arc};

use courier_core::Subscription;
use handlebars::{handlebars_helper, no_escape, Handlebars};
use serde_json::{json, Value};
use thiserror::Error;

/// Template failures. Both are permanent for the delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformationError {
    /// Template failed to parse or referenced a missing value.
    #[error("template render failed: {message}")]
    Render {
        /// Renderer error message
        message: String,
    },

    /// Rendered output is not JSON.
    #[error("template output is not valid JSON: {message}")]
    InvalidOutput {
        /// Parser error message
        message: String,
    },
}

impl TransformationError {
    /// Creates a render error.
    pub fn render(message: impl Into<String>) -> Self {
        Self::Render { message: message.into() }
    }

    /// Creates an invalid output error.
    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::InvalidOutput { message: message.into() }
    }
}

/// Renders a template against a JSON context.
pub trait PayloadRenderer: Send + Sync + Debug {
    /// Renders `template` with `context` as its data.
    ///
    /// # Errors
    ///
    /// Returns `TransformationError::Render` if the template cannot be
    /// rendered.
    fn render(&self, template: &str, context: &Value) -> Result<String, TransformationError>;
}

handlebars_helper!(json_helper: |value: Json| serde_json::to_string(value).unwrap_or_default());

/// Handlebars renderer in strict mode without HTML escaping.
///
/// Registers a `json` helper that serializes its argument, so
/// `{"items": {{json event.items}} }` embeds structured values.
#[derive(Debug)]
pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
}

impl HandlebarsRenderer {
    /// Creates a renderer with the `json` helper registered.
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(no_escape);
        registry.register_helper("json", Box::new(json_helper));
        Self { registry }
    }
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadRenderer for HandlebarsRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<String, TransformationError> {
        self.registry
            .render_template(template, context)
            .map_err(|e| TransformationError::render(e.to_string()))
    }
}

/// Applies field exclusion and templating.
#[derive(Debug, Clone)]
pub struct PayloadTransformer {
    renderer: Arc<dyn PayloadRenderer>,
}

impl Default for PayloadTransformer {
    fn default() -> Self {
        Self::new(Arc::new(HandlebarsRenderer::new()))
    }
}

impl PayloadTransformer {
    /// Creates a transformer over `renderer`.
    pub fn new(renderer: Arc<dyn PayloadRenderer>) -> Self {
        Self { renderer }
    }

    /// Filters then templates `payload` according to `subscription`.
    ///
    /// # Errors
    ///
    /// Returns the template error, if any.
    pub fn apply(&self, subscription: &Subscription, payload: &Value) -> Result<Value, TransformationError> {
        let filtered = filter_fields(payload, &subscription.excluded_fields);
        self.transform_payload(filtered, subscription.template.as_deref())
    }

    /// Renders `payload` through `template`, or returns it unchanged.
    ///
    /// # Errors
    ///
    /// - `Render` when rendering fails
    /// - `InvalidOutput` when the output is not JSON
    pub fn transform_payload(&self, payload: Value, template: Option<&str>) -> Result<Value, TransformationError> {
        let Some(template) = template.filter(|t| !t.trim().is_empty()) else {
            return Ok(payload);
        };

        let rendered = self.renderer.render(template, &json!({ "event": payload }))?;
        serde_json::from_str(&rendered).map_err(|e| TransformationError::invalid_output(e.to_string()))
    }
}

/// Deep copy of `payload` without the leaves named by `paths`.
///
/// Paths that do not resolve are ignored, so applying the same paths twice
/// yields the same result.
pub fn filter_fields(payload: &Value, paths: &[String]) -> Value {
    let mut filtered = payload.clone();
    for path in paths {
        remove_path(&mut filtered, path);
    }
    filtered
}

fn remove_path(value: &mut Value, path: &str) {
    let (parents, leaf) = path.rsplit_once('.').unwrap_or(("", path));

    let mut current = value;
    if !parents.is_empty() {
        for segment in parents.split('.') {
            let Some(next) = current.as_object_mut().and_then(|map| map.get_mut(segment)) else {
                return;
            };
            current = next;
        }
    }

    if let Some(map) = current.as_object_mut() {
        map.remove(leaf);
    }
}

#[cfg(test)]
mod tests {
    use courier_core::SigningConfig;

    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn filter_removes_nested_leaves() {
        let payload = json!({"id": 1, "customer": {"email": "a@b.c", "name": "Ann"}});

        let filtered = filter_fields(&payload, &paths(&["customer.email", "missing.path", "id.x"]));

        assert_eq!(filtered, json!({"id": 1, "customer": {"name": "Ann"}}));
        assert_eq!(payload["customer"]["email"], "a@b.c");
    }

    #[test]
    fn filter_is_idempotent() {
        let payload = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let excluded = paths(&["a.b", "d"]);

        let once = filter_fields(&payload, &excluded);
        assert_eq!(filter_fields(&once, &excluded), once);
    }

    #[test]
    fn no_template_is_identity() {
        let transformer = PayloadTransformer::default();
        let payload = json!({"x": [1, 2, 3]});

        assert_eq!(transformer.transform_payload(payload.clone(), None).unwrap(), payload);
        assert_eq!(transformer.transform_payload(payload.clone(), Some("  ")).unwrap(), payload);
    }

    #[test]
    fn template_reshapes_payload() {
        let transformer = PayloadTransformer::default();
        let payload = json!({"id": 7, "customer": {"name": "O'Neil & Sons"}, "items": [{"sku": "A"}]});
        let template = r#"{"order": {{event.id}}, "name": "{{event.customer.name}}", "items": {{json event.items}} }"#;

        let out = transformer.transform_payload(payload, Some(template)).unwrap();

        assert_eq!(out, json!({"order": 7, "name": "O'Neil & Sons", "items": [{"sku": "A"}]}));
    }

    #[test]
    fn missing_variable_is_render_error() {
        let transformer = PayloadTransformer::default();

        let err = transformer.transform_payload(json!({}), Some(r#"{"a": {{event.nope}} }"#)).unwrap_err();

        assert!(matches!(err, TransformationError::Render { .. }));
    }

    #[test]
    fn unparseable_template_is_render_error() {
        let transformer = PayloadTransformer::default();

        let err = transformer.transform_payload(json!({}), Some("{{#if}}")).unwrap_err();

        assert!(matches!(err, TransformationError::Render { .. }));
    }

    #[test]
    fn non_json_output_is_invalid_output() {
        let transformer = PayloadTransformer::default();

        let err = transformer.transform_payload(json!({"id": 1}), Some("id={{event.id}}")).unwrap_err();

        assert!(matches!(err, TransformationError::InvalidOutput { .. }));
    }

    #[test]
    fn apply_filters_before_templating() {
        let transformer = PayloadTransformer::default();
        let mut subscription = Subscription::new("https://example.com", SigningConfig::hmac_sha256("k"));
        subscription.excluded_fields = paths(&["secret"]);
        subscription.template = Some(r#"{"body": {{json event}} }"#.to_string());

        let out = transformer.apply(&subscription, &json!({"secret": 1, "ok": true})).unwrap();

        assert_eq!(out, json!({"body": {"ok": true}}));
    }

    #[derive(Debug)]
    struct Upper;

    impl PayloadRenderer for Upper {
        fn render(&self, template: &str, _context: &Value) -> Result<String, TransformationError> {
            Ok(template.to_uppercase())
        }
    }

    #[test]
    fn renderer_is_pluggable() {
        let transformer = PayloadTransformer::new(Arc::new(Upper));

        let out = transformer.transform_payload(json!({}), Some(r#""shout""#)).unwrap();

        assert_eq!(out, json!("SHOUT"));
    }
}
