//! Event size estimation for byte-budgeted polling.

use harvest_config_and_utils::Event;
use serde_json::Value;

/// Size assumed for an event when no estimator is supplied.
pub const FALLBACK_EVENT_SIZE: usize = 100;

/// Nesting depth beyond which values count as zero.
const MAX_DEPTH: usize = 5;

/// Entries of one object or array that are looked at.
const MAX_ENTRIES: usize = 20;

/// Approximates the in-flight size of an event.
pub trait SizeEstimator: Send + Sync {
    fn estimate(&self, event: &Event) -> usize;
}

/// Cheap structural estimate: strings 2 bytes per char, numbers 8, booleans 1,
/// null 4, containers summed over their first few entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSizeEstimator;

impl DefaultSizeEstimator {
    pub fn new() -> Self {
        Self
    }
}

impl SizeEstimator for DefaultSizeEstimator {
    fn estimate(&self, event: &Event) -> usize {
        event
            .fields()
            .iter()
            .take(MAX_ENTRIES)
            .map(|(key, value)| string_size(key) + value_size(value, 1))
            .sum()
    }
}

fn string_size(s: &str) -> usize {
    s.chars().count() * 2
}

fn value_size(value: &Value, depth: usize) -> usize {
    if depth >= MAX_DEPTH {
        return 0;
    }

    match value {
        Value::Null => 4,
        Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => string_size(s),
        Value::Array(items) => items
            .iter()
            .take(MAX_ENTRIES)
            .map(|item| value_size(item, depth + 1))
            .sum(),
        Value::Object(map) => map
            .iter()
            .take(MAX_ENTRIES)
            .map(|(key, value)| string_size(key) + value_size(value, depth + 1))
            .sum(),
    }
}

/// Size of `event` under `estimator`, or [`FALLBACK_EVENT_SIZE`] without one.
pub fn estimate_or_fallback(estimator: Option<&dyn SizeEstimator>, event: &Event) -> usize {
    estimator.map_or(FALLBACK_EVENT_SIZE, |e| e.estimate(event))
}
