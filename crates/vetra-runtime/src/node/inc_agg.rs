//! Incremental window aggregation: per-dimension running aggregates keyed
//! by window, advanced on each input instead of materializing the buffer.

use crate::aggregation::{Accumulator, AggField};
use crate::context::NodeContext;
use crate::error::{EngineError, Result};
use crate::node::source::now_ms;
use crate::node::window::{WindowConfig, WindowType};
use crate::node::{broadcast, spawn_safe, NodeBase, TopoNode};
use crate::tuple::{Collection, SharedTuple, StreamItem, WindowRange};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use vetra_core::{RuleOptions, Value};

/// Running aggregates for one dimension inside one window.
#[derive(Clone)]
struct IncAggRange {
    accs: Vec<Accumulator>,
    fields: Vec<Value>,
    last_row: SharedTuple,
}

/// A window whose aggregates are kept up to date incrementally.
#[derive(Clone)]
struct IncAggWindow {
    start_time: i64,
    ranges: IndexMap<String, IncAggRange>,
    /// Rows folded into this window; observable for accounting.
    rows: u64,
}

impl IncAggWindow {
    fn new(start_time: i64) -> Self {
        Self {
            start_time,
            ranges: IndexMap::new(),
            rows: 0,
        }
    }
}

/// Dimension key: evaluated dimension values joined with commas.
fn cal_dimension(dims: &[String], row: &SharedTuple) -> String {
    let mut name = String::from("dim_");
    for d in dims {
        match row.get(d) {
            Some(v) => {
                name.push_str(&v.to_string());
                name.push(',');
            }
            None => {
                name.push_str("null,");
            }
        }
    }
    name
}

/// Fold one row into a window: look up or create the dimension range,
/// advance every accumulator by the row, refresh the computed fields and
/// remember the row.
fn inc_agg_cal(window: &mut IncAggWindow, dim: &str, row: &SharedTuple, agg_fields: &[AggField]) {
    let range = window.ranges.entry(dim.to_string()).or_insert_with(|| IncAggRange {
        accs: agg_fields.iter().map(|f| Accumulator::new(f.func)).collect(),
        fields: vec![Value::Null; agg_fields.len()],
        last_row: row.clone(),
    });
    range.last_row = row.clone();
    for (i, agg) in agg_fields.iter().enumerate() {
        let value = agg.field.as_deref().and_then(|f| row.get(f));
        range.accs[i].step(value);
        range.fields[i] = range.accs[i].value();
    }
    window.rows += 1;
}

/// Drop windows whose span has fully elapsed.
fn gc_windows(list: Vec<IncAggWindow>, length_ms: i64, now: i64) -> Vec<IncAggWindow> {
    list.into_iter()
        .filter(|w| now - w.start_time < length_ms)
        .collect()
}

pub struct WindowIncAggOp {
    base: NodeBase,
    config: WindowConfig,
    dims: Vec<String>,
    agg_fields: Vec<AggField>,
    is_event_time: bool,
}

impl std::fmt::Debug for WindowIncAggOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowIncAggOp")
            .field("dims", &self.dims)
            .field("agg_fields", &self.agg_fields)
            .field("is_event_time", &self.is_event_time)
            .finish()
    }
}

impl WindowIncAggOp {
    pub fn new(
        name: impl Into<Arc<str>>,
        options: &RuleOptions,
        config: WindowConfig,
        dims: Vec<String>,
        agg_fields: Vec<AggField>,
    ) -> Result<Self> {
        match config.window_type {
            WindowType::Count => {
                if config.count_length == 0 {
                    return Err(EngineError::Plan("count window needs a length".to_string()));
                }
            }
            WindowType::Session => {
                return Err(EngineError::Plan(
                    "session window does not support incremental aggregation".to_string(),
                ));
            }
            WindowType::Tumbling | WindowType::Sliding => {
                if config.length.is_zero() {
                    return Err(EngineError::Plan("window length must be positive".to_string()));
                }
            }
            WindowType::Hopping => {
                if config.length.is_zero() || config.interval.is_zero() {
                    return Err(EngineError::Plan(
                        "window length and interval must be positive".to_string(),
                    ));
                }
            }
        }
        Ok(Self {
            base: NodeBase::new(name, options),
            config,
            dims,
            agg_fields,
            is_event_time: options.is_event_time,
        })
    }
}

impl TopoNode for WindowIncAggOp {
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
        let input = base.take_input();
        let op = base.name.clone();
        let run = IncAggRun {
            ctx,
            outputs: base.outputs,
            send_error: base.send_error,
            config: self.config,
            dims: self.dims,
            agg_fields: self.agg_fields,
        };
        let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            match (run.config.window_type, self.is_event_time) {
                (WindowType::Count, _) => Box::pin(run.exec_count(input)),
                (WindowType::Tumbling, _) => Box::pin(run.exec_tumbling(input)),
                (WindowType::Sliding, true) => Box::pin(run.exec_event_sliding(input)),
                (WindowType::Sliding, false) => Box::pin(run.exec_sliding(input)),
                (WindowType::Hopping, _) => Box::pin(run.exec_hopping(input)),
                (WindowType::Session, _) => unreachable!("rejected at construction"),
            };
        spawn_safe(op, err_tx, fut);
    }
}

struct IncAggRun {
    ctx: NodeContext,
    outputs: Vec<mpsc::Sender<StreamItem>>,
    send_error: bool,
    config: WindowConfig,
    dims: Vec<String>,
    agg_fields: Vec<AggField>,
}

impl IncAggRun {
    async fn ingest(&self, item: StreamItem) -> Option<StreamItem> {
        match item {
            StreamItem::Error(e) => {
                self.ctx.stats.inc_exceptions();
                if self.send_error {
                    broadcast(&self.ctx, &self.outputs, StreamItem::Error(e)).await;
                }
                None
            }
            StreamItem::Eof => {
                broadcast(&self.ctx, &self.outputs, StreamItem::Eof).await;
                None
            }
            StreamItem::Tuple(_) | StreamItem::Watermark(_) => Some(item),
            other => {
                let e = EngineError::Fatal(format!(
                    "run incremental window error: expect tuple type but got {:?}",
                    other
                ));
                self.ctx.stats.inc_exceptions();
                broadcast(&self.ctx, &self.outputs, StreamItem::Error(e)).await;
                None
            }
        }
    }

    /// Write the running fields onto each dimension's last row and emit the
    /// window as one collection covering `[start, now]`.
    async fn emit(&self, window: &IncAggWindow, now: i64) {
        let mut content: Vec<SharedTuple> = Vec::with_capacity(window.ranges.len());
        for range in window.ranges.values() {
            let mut row = range.last_row.as_ref().clone();
            for (i, agg) in self.agg_fields.iter().enumerate() {
                row.set(agg.alias.as_str(), range.fields[i].clone());
            }
            content.push(Arc::new(row));
        }
        let collection = Collection::new(content, WindowRange::new(window.start_time, now));
        broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
    }

    fn matches(&self, t: &SharedTuple) -> bool {
        match &self.config.trigger_condition {
            Some(p) => p(t),
            None => true,
        }
    }

    async fn exec_count(self, mut input: mpsc::Receiver<StreamItem>) {
        let window_size = self.config.count_length;
        let mut curr: Option<IncAggWindow> = None;
        let mut curr_size = 0usize;
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let now = now_ms();
                    let Some(StreamItem::Tuple(row)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    let window = curr.get_or_insert_with(|| IncAggWindow::new(now));
                    let dim = cal_dimension(&self.dims, &row);
                    inc_agg_cal(window, &dim, &row, &self.agg_fields);
                    curr_size += 1;
                    if curr_size >= window_size {
                        self.emit(window, now_ms()).await;
                        curr = None;
                        curr_size = 0;
                    }
                }
            }
        }
    }

    async fn exec_tumbling(self, mut input: mpsc::Receiver<StreamItem>) {
        let mut ticker = tokio::time::interval(self.config.length);
        ticker.tick().await;
        let mut curr: Option<IncAggWindow> = None;
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let now = now_ms();
                    let Some(StreamItem::Tuple(row)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    let window = curr.get_or_insert_with(|| IncAggWindow::new(now));
                    let dim = cal_dimension(&self.dims, &row);
                    inc_agg_cal(window, &dim, &row, &self.agg_fields);
                }
                _ = ticker.tick() => {
                    if let Some(window) = curr.take() {
                        self.emit(&window, now_ms()).await;
                    }
                }
            }
        }
    }

    async fn exec_sliding(self, mut input: mpsc::Receiver<StreamItem>) {
        let length_ms = self.config.length.as_millis() as i64;
        let mut curr_list: Vec<IncAggWindow> = Vec::new();
        // Deferred windows are keyed by a monotonic id so a firing always
        // resolves to the exact window its trigger opened, even when several
        // triggers land in the same millisecond.
        let mut delay_list: Vec<(u64, IncAggWindow)> = Vec::new();
        let mut next_delay_key: u64 = 0;
        // Delayed emissions arrive over a task channel rather than by shared
        // mutation; windows stay owned by this task.
        let (task_tx, mut task_rx) = mpsc::channel::<u64>(1024);
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let now = now_ms();
                    let Some(StreamItem::Tuple(row)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    curr_list = gc_windows(curr_list, length_ms, now);
                    let dim = cal_dimension(&self.dims, &row);
                    if !self.config.delay.is_zero() {
                        let matched = self.matches(&row);
                        if matched {
                            next_delay_key += 1;
                            delay_list.push((next_delay_key, IncAggWindow::new(now)));
                        }
                        for (_, w) in delay_list.iter_mut() {
                            inc_agg_cal(w, &dim, &row, &self.agg_fields);
                        }
                        if matched {
                            let fire_key = next_delay_key;
                            let tx = task_tx.clone();
                            let delay = self.config.delay;
                            let token = self.ctx.token.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = token.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => { let _ = tx.send(fire_key).await; }
                                }
                            });
                        }
                        continue;
                    }
                    curr_list.push(IncAggWindow::new(now));
                    for w in curr_list.iter_mut() {
                        inc_agg_cal(w, &dim, &row, &self.agg_fields);
                    }
                    if !curr_list.is_empty() && self.matches(&row) {
                        self.emit(&curr_list[0], now).await;
                    }
                }
                fire_key = task_rx.recv() => {
                    let Some(fire_key) = fire_key else { return };
                    let now = now_ms();
                    // Move the matured delay window into the active list.
                    if let Some(pos) = delay_list.iter().position(|(k, _)| *k == fire_key) {
                        let (_, window) = delay_list.remove(pos);
                        self.emit(&window, now).await;
                        curr_list.push(window);
                    }
                }
            }
        }
    }

    async fn exec_hopping(self, mut input: mpsc::Receiver<StreamItem>) {
        let length_ms = self.config.length.as_millis() as i64;
        let mut curr_list: Vec<IncAggWindow> = Vec::new();
        let (task_tx, mut task_rx) = mpsc::channel::<i64>(1024);
        let mut ticker = tokio::time::interval(self.config.interval);
        self.open_hop(&task_tx, now_ms(), &mut curr_list);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                _ = ticker.tick() => {
                    let now = now_ms();
                    curr_list = gc_windows(curr_list, length_ms, now);
                    self.open_hop(&task_tx, now, &mut curr_list);
                }
                start = task_rx.recv() => {
                    let Some(start) = start else { return };
                    let now = now_ms();
                    if let Some(window) = curr_list.iter().find(|w| w.start_time == start) {
                        self.emit(window, now).await;
                    }
                    curr_list = gc_windows(curr_list, length_ms, now);
                }
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let now = now_ms();
                    let Some(StreamItem::Tuple(row)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    curr_list = gc_windows(curr_list, length_ms, now);
                    let dim = cal_dimension(&self.dims, &row);
                    for w in curr_list.iter_mut() {
                        inc_agg_cal(w, &dim, &row, &self.agg_fields);
                    }
                }
            }
        }
    }

    fn open_hop(&self, task_tx: &mpsc::Sender<i64>, now: i64, curr_list: &mut Vec<IncAggWindow>) {
        curr_list.push(IncAggWindow::new(now));
        let tx = task_tx.clone();
        let length = self.config.length;
        let token = self.ctx.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(length) => { let _ = tx.send(now).await; }
            }
        });
    }

    /// Event-time sliding: windows ready in principle wait in an emit list
    /// until the watermark passes their start time.
    async fn exec_event_sliding(self, mut input: mpsc::Receiver<StreamItem>) {
        let length_ms = self.config.length.as_millis() as i64;
        let delay_ms = self.config.delay.as_millis() as i64;
        let mut curr_list: Vec<IncAggWindow> = Vec::new();
        let mut emit_list: Vec<IncAggWindow> = Vec::new();
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    match self.ingest(item).await {
                        Some(StreamItem::Watermark(watermark_ts)) => {
                            curr_list = gc_windows(curr_list, length_ms, watermark_ts);
                            // Emit pending windows up to the watermark,
                            // preserving order.
                            let mut drained = 0;
                            for w in emit_list.iter() {
                                if w.start_time <= watermark_ts {
                                    self.emit(w, watermark_ts).await;
                                    drained += 1;
                                } else {
                                    break;
                                }
                            }
                            emit_list.drain(..drained);
                        }
                        Some(StreamItem::Tuple(row)) => {
                            self.ctx.stats.inc_records_in();
                            let ts = row.timestamp;
                            curr_list = gc_windows(curr_list, length_ms, ts);
                            let dim = cal_dimension(&self.dims, &row);
                            if delay_ms > 0 {
                                // A window opens per tuple before the match
                                // check on this path.
                                curr_list.push(IncAggWindow::new(ts));
                                for w in curr_list.iter_mut() {
                                    inc_agg_cal(w, &dim, &row, &self.agg_fields);
                                }
                                for w in emit_list.iter_mut() {
                                    inc_agg_cal(w, &dim, &row, &self.agg_fields);
                                }
                                if self.matches(&row) {
                                    let mut snapshot = curr_list[0].clone();
                                    snapshot.start_time = ts + delay_ms;
                                    emit_list.push(snapshot);
                                }
                            } else {
                                curr_list.push(IncAggWindow::new(ts));
                                for w in curr_list.iter_mut() {
                                    inc_agg_cal(w, &dim, &row, &self.agg_fields);
                                }
                                if self.matches(&row) {
                                    let mut snapshot = curr_list[0].clone();
                                    snapshot.start_time = ts;
                                    emit_list.push(snapshot);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
