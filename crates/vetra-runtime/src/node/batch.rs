//! Batch operator: size- and/or time-triggered batching with linger.

use crate::context::NodeContext;
use crate::error::{EngineError, Result};
use crate::node::{broadcast, drain_error, ingest, spawn_safe, Ingested, NodeBase, TopoNode};
use crate::tuple::{Collection, StreamItem};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use vetra_core::RuleOptions;

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Buffers tuples and emits them as one collection, triggered by size,
/// by linger interval, or by whichever trips first. The linger ticker runs
/// continuously and is not reset by size-triggered flushes.
pub struct BatchOp {
    base: NodeBase,
    batch_size: usize,
    linger_interval: Option<Duration>,
}

impl BatchOp {
    pub fn new(
        name: impl Into<Arc<str>>,
        options: &RuleOptions,
        batch_size: usize,
        linger_interval: Option<Duration>,
    ) -> Result<Self> {
        if batch_size == 0 && linger_interval.map_or(true, |d| d.is_zero()) {
            return Err(EngineError::Plan(
                "either batchSize or lingerInterval should be larger than 0".to_string(),
            ));
        }
        Ok(Self {
            base: NodeBase::new(name, options),
            batch_size,
            linger_interval: linger_interval.filter(|d| !d.is_zero()),
        })
    }
}

struct BatchRun {
    ctx: NodeContext,
    outputs: Vec<mpsc::Sender<StreamItem>>,
    send_error: bool,
    batch_size: usize,
    buffer: Collection,
}

impl BatchRun {
    fn new_buffer(&self) -> Collection {
        Collection::with_capacity(if self.batch_size > 0 {
            self.batch_size
        } else {
            DEFAULT_BUFFER_CAPACITY
        })
    }

    async fn ingest_item(&mut self, item: StreamItem, check_size: bool) {
        let data = match ingest(&self.ctx, &self.outputs, self.send_error, item).await {
            Ingested::Data(d) => d,
            Ingested::Watermark(ts) => {
                broadcast(&self.ctx, &self.outputs, StreamItem::Watermark(ts)).await;
                return;
            }
            Ingested::Handled => return,
        };
        self.ctx.stats.inc_records_in();
        match data {
            StreamItem::Tuple(t) => self.buffer.add(t),
            // A collection input is flattened into individual tuples.
            StreamItem::Collection(c) => {
                for t in c.content {
                    self.buffer.add(t);
                }
            }
            other => {
                debug!(op = %self.ctx.op_id, "batch ignores input type {:?}", other);
            }
        }
        if check_size && self.batch_size > 0 && self.buffer.len() >= self.batch_size {
            self.send().await;
        }
        self.ctx.stats.inc_messages_processed();
    }

    /// Empty flushes are elided.
    async fn send(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let out = std::mem::replace(&mut self.buffer, Collection::default());
        self.buffer = self.new_buffer();
        broadcast(&self.ctx, &self.outputs, StreamItem::Collection(out)).await;
    }
}

impl TopoNode for BatchOp {
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
        let batch_size = self.batch_size;
        let linger = self.linger_interval;
        let op = base.name.clone();

        let mut run = BatchRun {
            ctx: ctx.clone(),
            outputs: base.outputs,
            send_error: base.send_error,
            batch_size,
            buffer: Collection::default(),
        };
        run.buffer = run.new_buffer();

        spawn_safe(op, err_tx, async move {
            match linger {
                Some(interval) => {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = ctx.token.cancelled() => return,
                            item = input.recv() => {
                                let Some(item) = item else { return };
                                // With a pure linger config, size never triggers.
                                run.ingest_item(item, batch_size > 0).await;
                            }
                            _ = ticker.tick() => {
                                run.send().await;
                            }
                        }
                    }
                }
                None => loop {
                    tokio::select! {
                        _ = ctx.token.cancelled() => return,
                        item = input.recv() => {
                            let Some(item) = item else { return };
                            run.ingest_item(item, true).await;
                        }
                    }
                },
            }
        });
    }
}
