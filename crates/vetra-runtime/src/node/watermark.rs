//! Watermark operator: buffers and sorts event-time tuples, emitting
//! watermark items that drive the window operators downstream.
//!
//! The watermark is the maximum observed event time minus the configured
//! late tolerance, and never recedes. Tuples at or before the watermark are
//! released in event-time order, so downstream inputs are monotonically
//! non-decreasing up to each watermark.

use crate::context::NodeContext;
use crate::error::EngineError;
use crate::node::{broadcast, ingest, spawn_safe, Ingested, NodeBase, TopoNode};
use crate::tuple::{SharedTuple, StreamItem};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use vetra_core::RuleOptions;

pub struct WatermarkOp {
    base: NodeBase,
    late_tolerance: i64,
}

impl WatermarkOp {
    pub fn new(name: impl Into<Arc<str>>, options: &RuleOptions) -> Self {
        Self {
            base: NodeBase::new(name, options),
            late_tolerance: options.late_tolerance as i64,
        }
    }
}

impl TopoNode for WatermarkOp {
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
        let late_tolerance = self.late_tolerance;

        spawn_safe(base.name.clone(), err_tx, async move {
            let mut buffer: Vec<SharedTuple> = Vec::new();
            let mut watermark: i64 = i64::MIN;
            loop {
                tokio::select! {
                    _ = ctx.token.cancelled() => return,
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        let data = match ingest(&ctx, &outputs, send_error, item).await {
                            Ingested::Data(d) => d,
                            // Upstream watermarks are superseded by ours.
                            Ingested::Watermark(_) | Ingested::Handled => continue,
                        };
                        let StreamItem::Tuple(t) = data else {
                            broadcast(&ctx, &outputs, data).await;
                            continue;
                        };
                        ctx.stats.inc_records_in();
                        let candidate = t.timestamp - late_tolerance;
                        // Drop tuples older than the released horizon.
                        if t.timestamp <= watermark {
                            debug!(op = %ctx.op_id, ts = t.timestamp, watermark, "dropping late tuple");
                            ctx.stats.inc_exceptions();
                            continue;
                        }
                        buffer.push(t);
                        if candidate > watermark {
                            watermark = candidate;
                            buffer.sort_by_key(|t| t.timestamp);
                            let mut released = 0;
                            for t in buffer.iter() {
                                if t.timestamp <= watermark {
                                    released += 1;
                                } else {
                                    break;
                                }
                            }
                            for t in buffer.drain(..released) {
                                broadcast(&ctx, &outputs, StreamItem::Tuple(t)).await;
                            }
                            broadcast(&ctx, &outputs, StreamItem::Watermark(watermark)).await;
                        }
                    }
                }
            }
        });
    }
}
