//! Aggregate operator: group-by over window collections.

use crate::context::NodeContext;
use crate::error::EngineError;
use crate::node::{broadcast, spawn_safe, NodeBase, TopoNode};
use crate::tuple::{Collection, GroupedTuples, GroupedTuplesSet, SharedTuple, StreamItem};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info_span;
use vetra_core::{RuleOptions, Value};

/// Groups each incoming collection by the configured dimensions and emits a
/// `GroupedTuplesSet` carrying the collection's window range. The window
/// bounds are addressable as the pseudo-fields `window_start` and
/// `window_end`.
pub struct AggregateOp {
    base: NodeBase,
    dims: Vec<String>,
}

impl AggregateOp {
    pub fn new(name: impl Into<Arc<str>>, options: &RuleOptions, dims: Vec<String>) -> Self {
        Self {
            base: NodeBase::new(name, options),
            dims,
        }
    }

}

fn dim_value(dims: &[String], t: &SharedTuple, c: &Collection) -> String {
    let mut key = String::new();
    for d in dims {
        let v = match d.as_str() {
            "window_start" => c.range.map(|r| Value::Int(r.begin)).unwrap_or(Value::Null),
            "window_end" => c.range.map(|r| Value::Int(r.end)).unwrap_or(Value::Null),
            field => t.get(field).cloned().unwrap_or(Value::Null),
        };
        key.push_str(&v.to_string());
        key.push(',');
    }
    key
}

/// `None` means no emission (empty grouping result).
fn apply_grouping(dims: &[String], c: &Collection) -> Option<GroupedTuplesSet> {
    let span = info_span!("aggregate_op");
    let _enter = span.enter();
    let mut groups: IndexMap<String, GroupedTuples> = IndexMap::new();
    for t in c.iter() {
        let key = dim_value(dims, t, c);
        groups
            .entry(key.clone())
            .or_insert_with(|| GroupedTuples {
                key,
                content: Vec::new(),
                range: c.range,
            })
            .content
            .push(t.clone());
    }
    if groups.is_empty() {
        None
    } else {
        Some(GroupedTuplesSet {
            groups: groups.into_values().collect(),
        })
    }
}

impl TopoNode for AggregateOp {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn input(&self) -> Option<mpsc::Sender<StreamItem>> {
        Some(self.base.input())
    }

    fn add_output(&mut self, tx: mpsc::Sender<StreamItem>) {
        self.base.add_output(tx);
    }

    fn spawn(self: Box<Self>, ctx: NodeContext, err_tx: mpsc::Sender<EngineError>) {
        let mut base = self.base;
        let mut input = base.take_input();
        let outputs = base.outputs;
        let send_error = base.send_error;
        let dims = self.dims;
        spawn_safe(base.name.clone(), err_tx, async move {
            loop {
                tokio::select! {
                    _ = ctx.token.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        match item {
                            StreamItem::Collection(c) => {
                                ctx.stats.inc_records_in();
                                if let Some(set) = apply_grouping(&dims, &c) {
                                    broadcast(&ctx, &outputs, StreamItem::Grouped(set)).await;
                                }
                                ctx.stats.inc_messages_processed();
                            }
                            StreamItem::Error(e) => {
                                ctx.stats.inc_exceptions();
                                if send_error {
                                    broadcast(&ctx, &outputs, StreamItem::Error(e)).await;
                                }
                            }
                            StreamItem::Eof => {
                                broadcast(&ctx, &outputs, StreamItem::Eof).await;
                            }
                            StreamItem::Watermark(ts) => {
                                broadcast(&ctx, &outputs, StreamItem::Watermark(ts)).await;
                            }
                            other => {
                                let e = EngineError::Fatal(format!(
                                    "run Group By error: invalid input {:?}",
                                    other
                                ));
                                ctx.stats.inc_exceptions();
                                broadcast(&ctx, &outputs, StreamItem::Error(e)).await;
                            }
                        }
                    }
                }
            }
        });
    }
}
