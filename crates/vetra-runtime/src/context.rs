//! Per-operator execution context.
//!
//! A context carries the rule and operator identity, the cancellation token
//! for the operator's task, its stats, and the keyed state map the
//! checkpoint coordinator snapshots.

use crate::metrics::NodeStats;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Keyed operator state, serialized for checkpointing.
pub type StateMap = FxHashMap<String, serde_json::Value>;

#[derive(Clone)]
pub struct NodeContext {
    pub rule_id: Arc<str>,
    pub op_id: Arc<str>,
    pub token: CancellationToken,
    pub stats: Arc<NodeStats>,
    state: Arc<Mutex<StateMap>>,
}

impl NodeContext {
    pub fn new(rule_id: impl Into<Arc<str>>, op_id: impl Into<Arc<str>>) -> Self {
        Self {
            rule_id: rule_id.into(),
            op_id: op_id.into(),
            token: CancellationToken::new(),
            stats: Arc::new(NodeStats::default()),
            state: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Derive a context for an operator: fresh identity, stats and state,
    /// child token so cancelling the parent cancels the operator.
    pub fn child(&self, op_id: impl Into<Arc<str>>) -> Self {
        Self {
            rule_id: self.rule_id.clone(),
            op_id: op_id.into(),
            token: self.token.child_token(),
            stats: Arc::new(NodeStats::default()),
            state: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// Stage a keyed state value for the next checkpoint.
    pub fn put_state<T: Serialize>(&self, key: &str, value: &T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.state.lock().unwrap().insert(key.to_string(), v);
        }
    }

    pub fn get_state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let guard = self.state.lock().unwrap();
        guard
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Snapshot the staged state for the checkpoint coordinator.
    pub fn state_snapshot(&self) -> StateMap {
        self.state.lock().unwrap().clone()
    }

    /// Replace the staged state wholesale, used on checkpoint replay.
    pub fn restore_state(&self, state: StateMap) {
        *self.state.lock().unwrap() = state;
    }

    pub fn state_handle(&self) -> Arc<Mutex<StateMap>> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_cancellation() {
        let root = NodeContext::new("rule1", "root");
        let child = root.child("op1");
        assert_eq!(&*child.rule_id, "rule1");
        assert_eq!(&*child.op_id, "op1");
        assert!(!child.token.is_cancelled());
        root.token.cancel();
        assert!(child.token.is_cancelled());
    }

    #[test]
    fn test_state_roundtrip() {
        let ctx = NodeContext::new("r", "op");
        ctx.put_state("count", &42u64);
        assert_eq!(ctx.get_state::<u64>("count"), Some(42));
        assert_eq!(ctx.get_state::<u64>("missing"), None);

        let snap = ctx.state_snapshot();
        assert_eq!(snap.len(), 1);

        let other = NodeContext::new("r", "op2");
        other.restore_state(snap);
        assert_eq!(other.get_state::<u64>("count"), Some(42));
    }
}
