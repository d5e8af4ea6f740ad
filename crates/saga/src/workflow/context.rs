//! Workflow context propagation
//!
//! Each step receives an immutable snapshot of the accumulated context and
//! returns a delta; the orchestrator merges the delta into a new snapshot.
//! Steps never mutate shared state directly, so context evolution stays
//! deterministic per workflow.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value updates a step hands back after executing
pub type ContextDelta = Map<String, Value>;

/// Immutable key/value snapshot accumulated across steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowContext(Map<String, Value>);

impl WorkflowContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from an existing map
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether the context holds the given key
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Produce a new snapshot with the delta applied
    ///
    /// Delta entries overwrite existing keys; the original snapshot is left
    /// untouched.
    pub fn merged(&self, delta: ContextDelta) -> Self {
        if delta.is_empty() {
            return self.clone();
        }

        let mut map = self.0.clone();
        for (key, value) in delta {
            map.insert(key, value);
        }
        Self(map)
    }
}

impl From<Map<String, Value>> for WorkflowContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(entries: &[(&str, Value)]) -> ContextDelta {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_merge_adds_entries() {
        let ctx = WorkflowContext::new();
        let merged = ctx.merged(delta(&[("record_id", json!("rec-1"))]));

        assert!(ctx.is_empty());
        assert_eq!(merged.get("record_id"), Some(&json!("rec-1")));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_merge_overwrites_existing_keys() {
        let ctx = WorkflowContext::new().merged(delta(&[("attempt", json!(1))]));
        let merged = ctx.merged(delta(&[("attempt", json!(2)), ("extra", json!(true))]));

        assert_eq!(ctx.get("attempt"), Some(&json!(1)));
        assert_eq!(merged.get("attempt"), Some(&json!(2)));
        assert_eq!(merged.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn test_empty_delta_is_identity() {
        let ctx = WorkflowContext::new().merged(delta(&[("k", json!("v"))]));
        let merged = ctx.merged(ContextDelta::new());
        assert_eq!(ctx, merged);
    }

    #[test]
    fn test_serde_transparent() {
        let ctx = WorkflowContext::new().merged(delta(&[("k", json!("v"))]));
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, json!({"k": "v"}));

        let parsed: WorkflowContext = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
