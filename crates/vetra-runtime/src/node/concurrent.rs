//! N-way concurrent worker harness with strict input-order preservation.
//!
//! A distributor round-robins items over dedicated per-worker channels; a
//! merger drains the workers' output channels in the same round-robin order.
//! Round-robin on both ends is the ordering primitive: outputs appear in
//! exactly the order the inputs arrived, for any worker count.

use crate::context::NodeContext;
use crate::error::EngineError;
use crate::node::{broadcast, drain_error, spawn_safe};
use crate::tuple::StreamItem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-item worker function. Control items never reach it.
pub type WorkerFn = Arc<dyn Fn(&NodeContext, StreamItem) -> Vec<StreamItem> + Send + Sync>;

/// Run `wf` over the input with `num_workers` workers, preserving order.
///
/// `send_interval` optionally spaces out the emission of the items produced
/// from a single input (used by the decode operator for array payloads).
pub fn run_with_order(
    ctx: NodeContext,
    mut input: mpsc::Receiver<StreamItem>,
    outputs: Vec<mpsc::Sender<StreamItem>>,
    err_tx: mpsc::Sender<EngineError>,
    num_workers: usize,
    send_error: bool,
    wf: WorkerFn,
    send_interval: Option<Duration>,
) {
    let num_workers = num_workers.max(1);
    let mut worker_txs = Vec::with_capacity(num_workers);
    let mut out_rxs = Vec::with_capacity(num_workers);

    for i in 0..num_workers {
        let (work_tx, mut work_rx) = mpsc::channel::<StreamItem>(1);
        let (done_tx, done_rx) = mpsc::channel::<Vec<StreamItem>>(1);
        worker_txs.push(work_tx);
        out_rxs.push(done_rx);

        let wctx = ctx.clone();
        let wf = wf.clone();
        spawn_safe(
            Arc::from(format!("{}-worker-{}", ctx.op_id, i)),
            err_tx.clone(),
            async move {
                loop {
                    tokio::select! {
                        _ = wctx.token.cancelled() => {
                            debug!(worker = i, "worker done");
                            return;
                        }
                        item = work_rx.recv() => {
                            let Some(item) = item else { return };
                            let result = if item.is_control() {
                                vec![item]
                            } else {
                                wctx.stats.inc_records_in();
                                wf(&wctx, item)
                            };
                            tokio::select! {
                                _ = wctx.token.cancelled() => return,
                                res = done_tx.send(result) => {
                                    if res.is_err() { return; }
                                }
                            }
                        }
                    }
                }
            },
        );
    }

    // Merger: read workers in the same round-robin order the distributor
    // filled them, one batch per worker per round.
    let mctx = ctx.clone();
    spawn_safe(
        Arc::from(format!("{}-merger", ctx.op_id)),
        err_tx.clone(),
        async move {
            loop {
                for rx in out_rxs.iter_mut() {
                    tokio::select! {
                        _ = mctx.token.cancelled() => {
                            debug!("merge done");
                            return;
                        }
                        batch = rx.recv() => {
                            let Some(batch) = batch else { return };
                            let mut first = true;
                            for item in batch {
                                if let (Some(iv), false) = (send_interval, first) {
                                    tokio::time::sleep(iv).await;
                                }
                                first = false;
                                match &item {
                                    StreamItem::Error(e) => {
                                        mctx.stats.inc_exceptions();
                                        if send_error {
                                            broadcast(&mctx, &outputs, StreamItem::Error(e.clone())).await;
                                        }
                                    }
                                    _ => broadcast(&mctx, &outputs, item).await,
                                }
                            }
                            mctx.stats.inc_messages_processed();
                        }
                    }
                }
            }
        },
    );

    // Distributor: round-robin all items, control tuples included.
    spawn_safe(
        Arc::from(format!("{}-distribute", ctx.op_id)),
        err_tx.clone(),
        async move {
            let mut counter = 0usize;
            loop {
                if counter == num_workers {
                    counter = 0;
                }
                tokio::select! {
                    _ = ctx.token.cancelled() => {
                        debug!("distribute done");
                        return;
                    }
                    item = input.recv() => {
                        let Some(item) = item else { return };
                        ctx.stats.set_buffer_length(input.len() as i64);
                        tokio::select! {
                            _ = ctx.token.cancelled() => return,
                            res = worker_txs[counter].send(item) => {
                                if res.is_err() {
                                    drain_error(&err_tx, EngineError::Fatal(format!(
                                        "worker {} of {} stopped", counter, ctx.op_id
                                    )));
                                    return;
                                }
                            }
                        }
                    }
                }
                counter += 1;
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ERROR_CHANNEL_CAPACITY;
    use crate::tuple::Tuple;
    use indexmap::IndexMap;
    use rustc_hash::FxBuildHasher;

    fn tuple(v: i64) -> StreamItem {
        StreamItem::tuple(
            Tuple::decoded("t", IndexMap::with_hasher(FxBuildHasher), v).with_field("v", v),
        )
    }

    fn value_of(item: &StreamItem) -> i64 {
        match item {
            StreamItem::Tuple(t) => t.get_int("v").unwrap(),
            other => panic!("unexpected item {:?}", other),
        }
    }

    async fn run_harness(num_workers: usize, inputs: usize) -> Vec<i64> {
        let ctx = NodeContext::new("r", "op");
        let (in_tx, in_rx) = mpsc::channel(inputs.max(1));
        let (out_tx, mut out_rx) = mpsc::channel(inputs.max(1));
        let (err_tx, _err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        // Identity worker with per-item varying latency to stress ordering.
        let wf: WorkerFn = Arc::new(|_ctx, item| {
            let v = value_of(&item);
            std::thread::sleep(Duration::from_micros((v % 7) as u64 * 100));
            vec![item]
        });
        run_with_order(ctx.clone(), in_rx, vec![out_tx], err_tx, num_workers, true, wf, None);

        for i in 0..inputs {
            in_tx.send(tuple(i as i64)).await.unwrap();
        }

        let mut got = Vec::with_capacity(inputs);
        for _ in 0..inputs {
            got.push(value_of(&out_rx.recv().await.unwrap()));
        }
        ctx.token.cancel();
        got
    }

    #[tokio::test]
    async fn test_order_preserved_single_worker() {
        let got = run_harness(1, 16).await;
        assert_eq!(got, (0..16).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_order_preserved_many_workers() {
        for n in [2, 3, 8] {
            let got = run_harness(n, 40).await;
            assert_eq!(got, (0..40).collect::<Vec<i64>>(), "workers = {}", n);
        }
    }

    #[tokio::test]
    async fn test_expanding_worker_preserves_order() {
        let ctx = NodeContext::new("r", "op");
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let (err_tx, _err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        // Each input i expands to [i*10, i*10+1].
        let wf: WorkerFn = Arc::new(|_ctx, item| {
            let v = value_of(&item);
            vec![tuple(v * 10), tuple(v * 10 + 1)]
        });
        run_with_order(ctx.clone(), in_rx, vec![out_tx], err_tx, 4, true, wf, None);

        for i in 0..6 {
            in_tx.send(tuple(i)).await.unwrap();
        }
        let mut got = Vec::new();
        for _ in 0..12 {
            got.push(value_of(&out_rx.recv().await.unwrap()));
        }
        assert_eq!(got, vec![0, 1, 10, 11, 20, 21, 30, 31, 40, 41, 50, 51]);
        ctx.token.cancel();
    }

    #[tokio::test]
    async fn test_control_items_bypass_worker() {
        let ctx = NodeContext::new("r", "op");
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (err_tx, _err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let wf: WorkerFn = Arc::new(|_ctx, _item| panic!("worker fn must not see control items"));
        run_with_order(ctx.clone(), in_rx, vec![out_tx], err_tx, 2, true, wf, None);

        in_tx.send(StreamItem::Watermark(42)).await.unwrap();
        in_tx.send(StreamItem::Eof).await.unwrap();
        assert!(matches!(out_rx.recv().await, Some(StreamItem::Watermark(42))));
        assert!(matches!(out_rx.recv().await, Some(StreamItem::Eof)));
        ctx.token.cancel();
    }

    #[tokio::test]
    async fn test_worker_panic_surfaces_fatal_error() {
        let ctx = NodeContext::new("r", "op");
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (err_tx, mut err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let wf: WorkerFn = Arc::new(|_ctx, _item| panic!("worker bug"));
        run_with_order(ctx.clone(), in_rx, vec![out_tx], err_tx, 1, true, wf, None);

        in_tx.send(tuple(1)).await.unwrap();
        let err = err_rx.recv().await.unwrap();
        assert!(matches!(err, EngineError::Fatal(_)));
        ctx.token.cancel();
    }
}
