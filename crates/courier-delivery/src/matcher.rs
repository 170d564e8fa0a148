//! Event routing: which subscriptions receive an event.
//!
//! A subscription matches when its event patterns accept the event type and
//! its filter accepts the payload. Patterns are `*`, an exact type, or a glob
//! such as `order.*`; globs compile to anchored regexes and are cached.
//!
//! Filters are flat maps from dot paths to expected values. A list of maps is
//! ANDed. String expressions and `$operator` objects are not evaluated: they
//! match, so a subscriber never silently loses events. The matcher warns
//! about each such filter once per subscription.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};

use courier_core::{FilterSpec, Subscription, SubscriptionId};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

/// Evaluates subscriptions against events.
#[derive(Debug, Default)]
pub struct SubscriptionMatcher {
    patterns: Mutex<HashMap<String, Option<Regex>>>,
    reported: Mutex<HashSet<(SubscriptionId, UnsupportedFilter)>>,
}

/// Filter syntax that is accepted but not evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnsupportedFilter {
    /// A string expression such as `total > 10`.
    Expression(String),
    /// A `$operator` key or value at this path.
    Operator(String),
}

impl SubscriptionMatcher {
    /// Creates a matcher with an empty pattern cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `subscription` should receive the event.
    pub fn is_match(&self, subscription: &Subscription, event_type: &str, payload: &Value) -> bool {
        self.matches_event_type(&subscription.event_patterns, event_type)
            && subscription.filter.as_ref().map_or(true, |filter| {
                evaluate_filter(filter, payload, &mut |unsupported| self.report(subscription.id, unsupported))
            })
    }

    /// Whether any pattern accepts `event_type`.
    pub fn matches_event_type(&self, patterns: &[String], event_type: &str) -> bool {
        patterns.iter().any(|pattern| self.matches_pattern(pattern, event_type))
    }

    fn matches_pattern(&self, pattern: &str, event_type: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if !pattern.contains('*') {
            return pattern == event_type;
        }

        let mut cache = self.patterns.lock().unwrap_or_else(PoisonError::into_inner);
        let compiled = cache.entry(pattern.to_string()).or_insert_with(|| compile_glob(pattern));
        compiled.as_ref().is_some_and(|regex| regex.is_match(event_type))
    }

    /// Number of compiled patterns held.
    pub fn cached_patterns(&self) -> usize {
        self.patterns.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of unsupported filters warned about so far.
    pub fn reported_filters(&self) -> usize {
        self.reported.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn report(&self, subscription_id: SubscriptionId, unsupported: UnsupportedFilter) {
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        if reported.contains(&(subscription_id, unsupported.clone())) {
            return;
        }

        match &unsupported {
            UnsupportedFilter::Expression(expression) => warn!(
                target: "courier::degraded",
                subscription_id = %subscription_id,
                expression = %expression,
                "filter expressions are not supported, matching"
            ),
            UnsupportedFilter::Operator(path) => warn!(
                target: "courier::degraded",
                subscription_id = %subscription_id,
                path = %path,
                "filter operators are not supported, matching"
            ),
        }
        reported.insert((subscription_id, unsupported));
    }
}

fn compile_glob(pattern: &str) -> Option<Regex> {
    let source = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
    match Regex::new(&source) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(pattern, error = %e, "invalid event pattern, it will never match");
            None
        },
    }
}

/// Whether `payload` satisfies `filter`. Unsupported syntax matches.
pub fn matches_filter(filter: &FilterSpec, payload: &Value) -> bool {
    evaluate_filter(filter, payload, &mut |_| {})
}

fn evaluate_filter(
    filter: &FilterSpec,
    payload: &Value,
    on_unsupported: &mut dyn FnMut(UnsupportedFilter),
) -> bool {
    match filter {
        FilterSpec::All(conditions) => conditions.iter().all(|c| matches_conditions(c, payload, on_unsupported)),
        FilterSpec::Single(conditions) => matches_conditions(conditions, payload, on_unsupported),
        FilterSpec::Expression(expression) => {
            on_unsupported(UnsupportedFilter::Expression(expression.clone()));
            true
        },
    }
}

fn matches_conditions(
    conditions: &Map<String, Value>,
    payload: &Value,
    on_unsupported: &mut dyn FnMut(UnsupportedFilter),
) -> bool {
    conditions.iter().all(|(path, expected)| {
        if is_operator_syntax(path, expected) {
            on_unsupported(UnsupportedFilter::Operator(path.clone()));
            return true;
        }
        lookup_path(payload, path).is_some_and(|actual| actual == expected)
    })
}

fn is_operator_syntax(path: &str, expected: &Value) -> bool {
    path.starts_with('$')
        || expected.as_object().is_some_and(|object| object.keys().any(|k| k.starts_with('$')))
}

/// Resolves a dot path such as `customer.tier` or `items.0.sku`.
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(payload, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
