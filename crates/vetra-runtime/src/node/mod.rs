//! Dataflow nodes: sources, operators and sinks.
//!
//! Every node owns a bounded input channel and a list of downstream senders.
//! Blocking send on a bounded channel is the backpressure primitive; every
//! loop selects on the node's cancellation token.

pub mod aggregate;
pub mod batch;
pub mod concurrent;
pub mod decode;
pub mod inc_agg;
pub mod sink;
pub mod source;
pub mod watermark;
pub mod window;

use crate::context::NodeContext;
use crate::error::EngineError;
use crate::tuple::StreamItem;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use vetra_core::RuleOptions;

/// Capacity of a topology's error channel. Small and drained with `try_send`
/// so that several failing tasks never deadlock on it.
pub const ERROR_CHANNEL_CAPACITY: usize = 2;

/// A node that can be wired into a topology and spawned.
pub trait TopoNode: Send {
    fn name(&self) -> &str;

    /// Sender feeding this node's input channel. `None` for sources.
    fn input(&self) -> Option<mpsc::Sender<StreamItem>>;

    /// Subscribe a downstream channel to this node's output.
    fn add_output(&mut self, tx: mpsc::Sender<StreamItem>);

    /// Start the node's tasks. Must return promptly; the tasks run until the
    /// context token is cancelled.
    fn spawn(self: Box<Self>, ctx: NodeContext, err_tx: mpsc::Sender<EngineError>);
}

/// Common plumbing shared by operators and sinks.
pub struct NodeBase {
    pub name: Arc<str>,
    input_tx: mpsc::Sender<StreamItem>,
    input_rx: Option<mpsc::Receiver<StreamItem>>,
    pub outputs: Vec<mpsc::Sender<StreamItem>>,
    pub send_error: bool,
    pub concurrency: usize,
}

impl NodeBase {
    pub fn new(name: impl Into<Arc<str>>, options: &RuleOptions) -> Self {
        let (input_tx, input_rx) = mpsc::channel(options.buffer_length.max(1));
        Self {
            name: name.into(),
            input_tx,
            input_rx: Some(input_rx),
            outputs: Vec::new(),
            send_error: options.send_error,
            concurrency: options.concurrency.max(1),
        }
    }

    pub fn input(&self) -> mpsc::Sender<StreamItem> {
        self.input_tx.clone()
    }

    pub fn add_output(&mut self, tx: mpsc::Sender<StreamItem>) {
        self.outputs.push(tx);
    }

    /// Take the receiver; called once when the node task starts.
    pub fn take_input(&mut self) -> mpsc::Receiver<StreamItem> {
        self.input_rx.take().expect("node input already taken")
    }
}

/// Broadcast an item to all downstream channels, counting it in the stats.
/// Aborts mid-send when the context is cancelled.
pub async fn broadcast(ctx: &NodeContext, outputs: &[mpsc::Sender<StreamItem>], item: StreamItem) {
    match &item {
        StreamItem::Error(e) => {
            debug!(op = %ctx.op_id, "broadcast error item: {}", e);
        }
        StreamItem::Watermark(_) | StreamItem::Eof => {}
        _ => ctx.stats.inc_records_out(),
    }
    for out in outputs {
        tokio::select! {
            _ = ctx.token.cancelled() => return,
            res = out.send(item.clone()) => {
                if res.is_err() {
                    debug!(op = %ctx.op_id, "downstream channel closed");
                }
            }
        }
    }
}

/// Outcome of pre-processing one channel item.
pub enum Ingested {
    /// A data item (tuple, collection, groups) for the operator to process.
    Data(StreamItem),
    /// A watermark, surfaced to operators that care about event time.
    Watermark(i64),
    /// Fully handled here (error counted/forwarded, EOF forwarded).
    Handled,
}

/// Shared ingest logic: errors are counted and forwarded only when
/// `send_error` is set; EOF is forwarded; watermarks are surfaced.
pub async fn ingest(
    ctx: &NodeContext,
    outputs: &[mpsc::Sender<StreamItem>],
    send_error: bool,
    item: StreamItem,
) -> Ingested {
    match item {
        StreamItem::Error(e) => {
            ctx.stats.inc_exceptions();
            if send_error {
                broadcast(ctx, outputs, StreamItem::Error(e)).await;
            }
            Ingested::Handled
        }
        StreamItem::Eof => {
            broadcast(ctx, outputs, StreamItem::Eof).await;
            Ingested::Handled
        }
        StreamItem::Watermark(ts) => Ingested::Watermark(ts),
        data => Ingested::Data(data),
    }
}

/// Push an error onto the bounded topology error channel without blocking.
/// When the channel is full the error is dropped; the first errors win.
pub fn drain_error(err_tx: &mpsc::Sender<EngineError>, e: EngineError) {
    let _ = err_tx.try_send(e);
}

/// Run a future as a task, converting a panic into a fatal error on the
/// topology error channel.
pub fn spawn_safe<F>(op: Arc<str>, err_tx: mpsc::Sender<EngineError>, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                drain_error(
                    &err_tx,
                    EngineError::Fatal(format!("operator {} panicked: {}", op, e)),
                );
            }
        }
    });
}
