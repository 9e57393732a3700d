//! Per-rule checkpoint staging and replay.
//!
//! Operators stage keyed state in their contexts; the coordinator snapshots
//! all of them under a monotonically increasing checkpoint id, persists the
//! completed map and retains the newest few in memory for replay.

use crate::context::{NodeContext, StateMap};
use crate::error::{EngineError, Result};
use crate::persistence::KvStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_MAX_CHECKPOINTS: usize = 3;

/// Checkpoint storage for one rule.
pub struct CheckpointStore {
    rule_id: String,
    kv: Arc<dyn KvStore>,
    inner: Mutex<Staging>,
    max_checkpoints: usize,
}

struct Staging {
    /// cp_id -> op_id -> keyed state, including not-yet-finalized ids.
    staged: BTreeMap<u64, HashMap<String, StateMap>>,
    /// Finalized checkpoint ids, oldest first.
    completed: Vec<u64>,
}

impl CheckpointStore {
    /// Open the store, loading the latest persisted checkpoint for replay.
    pub fn open(rule_id: impl Into<String>, kv: Arc<dyn KvStore>) -> Result<Self> {
        let rule_id = rule_id.into();
        let mut staged = BTreeMap::new();
        let mut completed = Vec::new();

        let prefix = format!("checkpoints.{}.", rule_id);
        let mut persisted: Vec<(u64, HashMap<String, StateMap>)> = Vec::new();
        for (key, value) in kv.scan_prefix(&prefix)? {
            let Some(id) = key[prefix.len()..].parse::<u64>().ok() else {
                continue;
            };
            match serde_json::from_value(value) {
                Ok(states) => persisted.push((id, states)),
                Err(e) => warn!(rule = %rule_id, cp = id, "skipping unreadable checkpoint: {}", e),
            }
        }
        persisted.sort_by_key(|(id, _)| *id);
        if let Some((id, states)) = persisted.into_iter().last() {
            debug!(rule = %rule_id, cp = id, "restored latest checkpoint");
            staged.insert(id, states);
            completed.push(id);
        }

        Ok(Self {
            rule_id,
            kv,
            inner: Mutex::new(Staging { staged, completed }),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
        })
    }

    /// Stage one operator's state under a checkpoint id.
    pub fn save_state(&self, cp_id: u64, op_id: &str, state: StateMap) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .staged
            .entry(cp_id)
            .or_default()
            .insert(op_id.to_string(), state);
    }

    /// Finalize a checkpoint: persist the staged map and retain only the
    /// newest `max_checkpoints` in memory.
    pub fn save_checkpoint(&self, cp_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let states = inner
            .staged
            .get(&cp_id)
            .ok_or_else(|| EngineError::Store(format!("checkpoint {} has no staged state", cp_id)))?
            .clone();
        let value = serde_json::to_value(&states)
            .map_err(|e| EngineError::Store(format!("serialize checkpoint {}: {}", cp_id, e)))?;
        self.kv
            .put(&format!("checkpoints.{}.{}", self.rule_id, cp_id), &value)?;

        inner.completed.push(cp_id);
        while inner.completed.len() > self.max_checkpoints {
            let old = inner.completed.remove(0);
            inner.staged.remove(&old);
        }
        Ok(())
    }

    /// State for one operator from the newest completed checkpoint. Empty if
    /// the operator was absent from that checkpoint.
    pub fn get_op_state(&self, op_id: &str) -> StateMap {
        let inner = self.inner.lock().unwrap();
        let Some(latest) = inner.completed.last() else {
            return StateMap::default();
        };
        inner
            .staged
            .get(latest)
            .and_then(|m| m.get(op_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Delete persisted checkpoints older than the oldest retained one.
    pub fn clean(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let Some(oldest) = inner.completed.first().copied() else {
            return Ok(());
        };
        let prefix = format!("checkpoints.{}.", self.rule_id);
        for (key, _) in self.kv.scan_prefix(&prefix)? {
            if let Ok(id) = key[prefix.len()..].parse::<u64>() {
                if id < oldest {
                    self.kv.delete(&key)?;
                }
            }
        }
        Ok(())
    }

    pub fn latest_completed(&self) -> Option<u64> {
        self.inner.lock().unwrap().completed.last().copied()
    }
}

/// Periodically snapshots registered operator contexts into the store.
pub struct CheckpointCoordinator {
    store: Arc<CheckpointStore>,
    ops: Vec<NodeContext>,
    interval: Duration,
    next_id: u64,
}

impl CheckpointCoordinator {
    pub fn new(store: Arc<CheckpointStore>, ops: Vec<NodeContext>, interval: Duration) -> Self {
        let next_id = store.latest_completed().map(|id| id + 1).unwrap_or(1);
        Self {
            store,
            ops,
            interval,
            next_id,
        }
    }

    /// Take one checkpoint now. Returns the checkpoint id.
    pub fn checkpoint_once(&mut self) -> Result<u64> {
        let cp_id = self.next_id;
        for ctx in &self.ops {
            self.store
                .save_state(cp_id, &ctx.op_id, ctx.state_snapshot());
        }
        self.store.save_checkpoint(cp_id)?;
        self.next_id += 1;
        debug!(cp = cp_id, "checkpoint complete");
        Ok(cp_id)
    }

    /// Run the checkpoint loop until the token is cancelled.
    pub fn spawn(mut self, token: CancellationToken) {
        if self.interval.is_zero() {
            return;
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.checkpoint_once() {
                            warn!("checkpoint failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}
