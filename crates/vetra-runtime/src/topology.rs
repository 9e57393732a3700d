//! Topology: the runtime DAG of nodes realizing a rule.
//!
//! A topology is built by the planner (an external collaborator behind the
//! `Planner` trait), opened once, and cancelled through the root
//! cancellation token. `cancel` does not await task exit; the rule state
//! machine drops the topology reference afterwards.

use crate::checkpoint::{CheckpointCoordinator, CheckpointStore};
use crate::context::NodeContext;
use crate::error::{EngineError, Result};
use crate::metrics::{Metrics, StatsSnapshot};
use crate::node::{TopoNode, ERROR_CHANNEL_CAPACITY};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use vetra_core::{Rule, RuleOptions};

/// Produces a topology from a rule definition. Stands in for the external
/// SQL planner.
pub trait Planner: Send + Sync {
    fn plan(&self, rule: &Rule) -> Result<Topology>;
}

/// Lifecycle state of a topology's context.
#[derive(Debug, Clone, PartialEq)]
pub enum TopoState {
    NotOpened,
    Open,
    /// Finished without error (also the placeholder left after a stop).
    Succeeded,
    Cancelled,
    Failed(EngineError),
}

/// Queryable shape of the topology, kept available after teardown.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrintableTopo {
    pub sources: Vec<String>,
    pub edges: IndexMap<String, Vec<String>>,
}

pub struct Topology {
    rule_id: Arc<str>,
    options: RuleOptions,
    nodes: IndexMap<String, Box<dyn TopoNode>>,
    sources: Vec<String>,
    edges: IndexMap<String, Vec<String>>,
    root: NodeContext,
    state: Arc<Mutex<TopoState>>,
    op_contexts: Vec<NodeContext>,
    checkpoint: Option<Arc<CheckpointStore>>,
    metrics: Option<Metrics>,
    opened: bool,
}

impl Topology {
    pub fn new(rule_id: impl Into<Arc<str>>, options: RuleOptions) -> Self {
        let rule_id = rule_id.into();
        Self {
            root: NodeContext::new(rule_id.clone(), "root"),
            rule_id,
            options,
            nodes: IndexMap::new(),
            sources: Vec::new(),
            edges: IndexMap::new(),
            state: Arc::new(Mutex::new(TopoState::NotOpened)),
            op_contexts: Vec::new(),
            checkpoint: None,
            metrics: None,
            opened: false,
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn add_source(&mut self, node: Box<dyn TopoNode>) -> Result<()> {
        let name = node.name().to_string();
        if node.input().is_some() {
            return Err(EngineError::Plan(format!("{} is not a source node", name)));
        }
        self.sources.push(name.clone());
        self.insert(name, node)
    }

    pub fn add_operator(&mut self, node: Box<dyn TopoNode>) -> Result<()> {
        let name = node.name().to_string();
        self.insert(name, node)
    }

    fn insert(&mut self, name: String, node: Box<dyn TopoNode>) -> Result<()> {
        if self.nodes.contains_key(&name) {
            return Err(EngineError::Plan(format!("duplicate node name {}", name)));
        }
        self.nodes.insert(name, node);
        Ok(())
    }

    /// Wire `from`'s output into `to`'s input channel.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        let input = self
            .nodes
            .get(to)
            .ok_or_else(|| EngineError::Plan(format!("unknown node {}", to)))?
            .input()
            .ok_or_else(|| EngineError::Plan(format!("{} cannot receive input", to)))?;
        let node = self
            .nodes
            .get_mut(from)
            .ok_or_else(|| EngineError::Plan(format!("unknown node {}", from)))?;
        node.add_output(input);
        self.edges.entry(from.to_string()).or_default().push(to.to_string());
        Ok(())
    }

    /// Start every node task. Returns the bounded error channel the rule
    /// runner drains; a fatal operator error arriving there triggers the
    /// restart strategy.
    pub fn open(&mut self) -> Result<mpsc::Receiver<EngineError>> {
        if self.opened {
            return Err(EngineError::Rule(format!(
                "topology of rule {} is already open",
                self.rule_id
            )));
        }
        if self.sources.is_empty() {
            return Err(EngineError::Plan("topology has no sources".to_string()));
        }
        self.opened = true;
        *self.state.lock().unwrap() = TopoState::Open;
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let nodes = std::mem::take(&mut self.nodes);
        for (name, node) in nodes {
            let ctx = self.root.child(name.as_str());
            if let Some(store) = &self.checkpoint {
                let state = store.get_op_state(&name);
                if !state.is_empty() {
                    ctx.restore_state(state);
                }
            }
            self.op_contexts.push(ctx.clone());
            node.spawn(ctx, err_tx.clone());
        }

        if let Some(store) = &self.checkpoint {
            let interval = Duration::from_millis(self.options.checkpoint_interval);
            if !interval.is_zero() {
                CheckpointCoordinator::new(store.clone(), self.op_contexts.clone(), interval)
                    .spawn(self.root.token.child_token());
            }
        }

        info!(rule = %self.rule_id, nodes = self.op_contexts.len(), "topology opened");
        Ok(err_rx)
    }

    pub fn has_open(&self) -> bool {
        self.opened
    }

    /// Cancel all node tasks. Does not await their exit.
    pub fn cancel(&self) {
        self.root.token.cancel();
        let mut state = self.state.lock().unwrap();
        if matches!(*state, TopoState::Open) {
            *state = TopoState::Cancelled;
        }
    }

    pub fn set_error(&self, e: EngineError) {
        *self.state.lock().unwrap() = TopoState::Failed(e);
    }

    pub fn state(&self) -> TopoState {
        self.state.lock().unwrap().clone()
    }

    /// An empty placeholder that keeps the graph queryable after a stop.
    /// It reports `has_open` so the next start re-plans instead of reusing
    /// it.
    pub fn succeeded_placeholder(&self) -> Topology {
        Topology {
            rule_id: self.rule_id.clone(),
            options: self.options.clone(),
            nodes: IndexMap::new(),
            sources: self.sources.clone(),
            edges: self.edges.clone(),
            root: NodeContext::new(self.rule_id.clone(), "root"),
            state: Arc::new(Mutex::new(TopoState::Succeeded)),
            op_contexts: Vec::new(),
            checkpoint: self.checkpoint.clone(),
            metrics: self.metrics.clone(),
            opened: true,
        }
    }

    pub fn graph(&self) -> PrintableTopo {
        PrintableTopo {
            sources: self.sources.clone(),
            edges: self.edges.clone(),
        }
    }

    /// Per-operator counters for the management surface; also mirrors them
    /// into Prometheus when export is enabled.
    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        let mut out = Vec::with_capacity(self.op_contexts.len());
        for ctx in &self.op_contexts {
            let snap = ctx.stats.snapshot();
            if let Some(metrics) = &self.metrics {
                metrics.record(&self.rule_id, &ctx.op_id, snap);
            }
            out.push((ctx.op_id.to_string(), snap));
        }
        out
    }

    /// Drop this rule's metric series.
    pub fn remove_metrics(&self) {
        if let Some(metrics) = &self.metrics {
            for ctx in &self.op_contexts {
                metrics.remove(&self.rule_id, &ctx.op_id);
            }
        }
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("rule_id", &self.rule_id)
            .field("sources", &self.sources)
            .field("edges", &self.edges)
            .field("opened", &self.opened)
            .finish()
    }
}
