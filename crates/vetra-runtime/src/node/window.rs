//! Window operators: event-time and processing-time tumbling, hopping,
//! sliding (with delay), session and count windows.
//!
//! Event-time execution is driven by watermark items produced upstream; the
//! watermark operator sorts tuples so inputs arrive non-decreasing in event
//! time up to the watermark. Processing-time execution is driven by tickers
//! and timers.

use crate::context::NodeContext;
use crate::error::{EngineError, Result};
use crate::node::source::now_ms;
use crate::node::{broadcast, spawn_safe, NodeBase, TopoNode};
use crate::tuple::{Collection, SharedTuple, StreamItem, Tuple, WindowRange};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use vetra_core::RuleOptions;

/// Checkpoint key for buffered window inputs.
pub const WINDOW_INPUTS_KEY: &str = "window_inputs";

/// Sentinel for "window end not determinable yet".
const TS_MAX: i64 = i64::MAX;

/// Predicate over tuples, used as the sliding-window trigger condition.
pub type TuplePredicate = Arc<dyn Fn(&Tuple) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Tumbling,
    Hopping,
    Sliding,
    Session,
    Count,
}

/// Calendar unit for aligned window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeUnit {
    fn millis(&self) -> i64 {
        match self {
            TimeUnit::Millisecond => 1,
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
            TimeUnit::Week => 7 * 86_400_000,
            TimeUnit::Month => 0, // calendar months have no fixed span
        }
    }
}

/// First window ends at a calendar-aligned boundary; later windows advance by
/// the interval. For fixed-span units the alignment is epoch-based (weeks
/// align to Monday); months walk the calendar.
pub fn get_aligned_window_end_time(event_ts: i64, raw_interval: i64, unit: TimeUnit) -> i64 {
    let interval = raw_interval.max(1);
    match unit {
        TimeUnit::Month => {
            let dt: DateTime<Utc> = Utc.timestamp_millis_opt(event_ts).single().unwrap_or_default();
            let mut end = Utc
                .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or_default();
            while end.timestamp_millis() <= event_ts {
                let (y, m) = {
                    let m0 = end.month0() as i64 + interval;
                    (
                        end.year() + (m0 / 12) as i32,
                        (m0 % 12) as u32 + 1,
                    )
                };
                end = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single().unwrap_or_default();
            }
            end.timestamp_millis()
        }
        TimeUnit::Week => {
            // Epoch day 0 was a Thursday; Monday-aligned weeks start 3 days
            // earlier.
            let period = interval * unit.millis();
            let offset = 3 * 86_400_000;
            ((event_ts + offset).div_euclid(period) + 1) * period - offset
        }
        _ => {
            let period = interval * unit.millis();
            (event_ts.div_euclid(period) + 1) * period
        }
    }
}

#[derive(Clone)]
pub struct WindowConfig {
    pub window_type: WindowType,
    /// Window span for tumbling/hopping/sliding; the calendar tick for
    /// session windows.
    pub length: Duration,
    /// Hop interval for hopping windows; gap timeout for session windows.
    pub interval: Duration,
    /// Deferred-emission delay for sliding windows.
    pub delay: Duration,
    /// Row count for count windows.
    pub count_length: usize,
    /// Raw numeric interval and unit used for calendar alignment.
    pub raw_interval: i64,
    pub time_unit: TimeUnit,
    pub trigger_condition: Option<TuplePredicate>,
}

impl WindowConfig {
    pub fn tumbling(length: Duration, raw_interval: i64, unit: TimeUnit) -> Self {
        Self {
            window_type: WindowType::Tumbling,
            length,
            interval: Duration::ZERO,
            delay: Duration::ZERO,
            count_length: 0,
            raw_interval,
            time_unit: unit,
            trigger_condition: None,
        }
    }

    pub fn hopping(length: Duration, interval: Duration, raw_interval: i64, unit: TimeUnit) -> Self {
        Self {
            window_type: WindowType::Hopping,
            length,
            interval,
            delay: Duration::ZERO,
            count_length: 0,
            raw_interval,
            time_unit: unit,
            trigger_condition: None,
        }
    }

    pub fn sliding(length: Duration, delay: Duration, trigger: Option<TuplePredicate>) -> Self {
        Self {
            window_type: WindowType::Sliding,
            length,
            interval: Duration::ZERO,
            delay,
            count_length: 0,
            raw_interval: length.as_millis() as i64,
            time_unit: TimeUnit::Millisecond,
            trigger_condition: trigger,
        }
    }

    pub fn session(length: Duration, timeout: Duration, raw_interval: i64, unit: TimeUnit) -> Self {
        Self {
            window_type: WindowType::Session,
            length,
            interval: timeout,
            delay: Duration::ZERO,
            count_length: 0,
            raw_interval,
            time_unit: unit,
            trigger_condition: None,
        }
    }

    pub fn count(count_length: usize) -> Self {
        Self {
            window_type: WindowType::Count,
            length: Duration::ZERO,
            interval: Duration::ZERO,
            delay: Duration::ZERO,
            count_length,
            raw_interval: 0,
            time_unit: TimeUnit::Millisecond,
            trigger_condition: None,
        }
    }

    fn length_ms(&self) -> i64 {
        self.length.as_millis() as i64
    }

    fn interval_ms(&self) -> i64 {
        self.interval.as_millis() as i64
    }

    fn delay_ms(&self) -> i64 {
        self.delay.as_millis() as i64
    }

    fn validate(&self, is_event_time: bool) -> Result<()> {
        match self.window_type {
            WindowType::Count => {
                if is_event_time {
                    return Err(EngineError::Plan(
                        "count window does not support event time".to_string(),
                    ));
                }
                if self.count_length == 0 {
                    return Err(EngineError::Plan("count window needs a length".to_string()));
                }
            }
            WindowType::Tumbling | WindowType::Sliding => {
                if self.length.is_zero() {
                    return Err(EngineError::Plan("window length must be positive".to_string()));
                }
            }
            WindowType::Hopping | WindowType::Session => {
                if self.length.is_zero() || self.interval.is_zero() {
                    return Err(EngineError::Plan(
                        "window length and interval must be positive".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn matches(&self, t: &Tuple) -> bool {
        match &self.trigger_condition {
            Some(p) => p(t),
            None => true,
        }
    }
}

/// Event-time trigger: computes upcoming window ends from the buffered
/// inputs and the watermark.
struct EventTimeTrigger {
    config: WindowConfig,
    interval: i64,
}

impl EventTimeTrigger {
    fn new(config: WindowConfig) -> Result<Self> {
        let interval = match config.window_type {
            WindowType::Tumbling => config.length_ms(),
            WindowType::Hopping => config.interval_ms(),
            WindowType::Sliding => config.length_ms(),
            WindowType::Session => config.interval_ms(),
            WindowType::Count => {
                return Err(EngineError::Plan(
                    "count window does not support event time".to_string(),
                ))
            }
        };
        Ok(Self { config, interval })
    }

    /// Next window end, or `TS_MAX` when it cannot be determined yet.
    fn get_next_window(&self, inputs: &[SharedTuple], current: i64, watermark: i64) -> i64 {
        match self.config.window_type {
            WindowType::Tumbling | WindowType::Hopping => {
                if current > 0 {
                    current + self.interval
                } else {
                    let next_ts = earliest_event_ts(inputs, current, watermark);
                    if next_ts == TS_MAX {
                        return next_ts;
                    }
                    get_aligned_window_end_time(
                        next_ts,
                        self.config.raw_interval,
                        self.config.time_unit,
                    )
                }
            }
            WindowType::Sliding => earliest_event_ts(inputs, current, watermark),
            _ => TS_MAX,
        }
    }

    /// Session windows close on a gap beyond the timeout or on an aligned
    /// length tick, whichever comes first. Returns `(end, ticked)`.
    fn get_next_session_window(&self, inputs: &[SharedTuple], now: i64) -> (i64, bool) {
        if inputs.is_empty() {
            return (TS_MAX, false);
        }
        let timeout = self.config.interval_ms();
        let duration = self.config.length_ms();
        let et = inputs[0].timestamp;
        let mut tick =
            get_aligned_window_end_time(et, self.config.raw_interval, self.config.time_unit);
        let mut p = 0i64;
        let mut ticked = false;
        for tuple in inputs {
            let mut r = TS_MAX;
            if p > 0 && tuple.timestamp - p > timeout {
                r = p + timeout;
            }
            if tuple.timestamp > tick {
                if tick - duration > et && tick < r {
                    r = tick;
                    ticked = true;
                }
                tick += duration;
            }
            if r < TS_MAX {
                return (r, ticked);
            }
            p = tuple.timestamp;
        }
        if p > 0 && now - p > timeout {
            return (p + timeout, ticked);
        }
        (TS_MAX, false)
    }
}

fn earliest_event_ts(inputs: &[SharedTuple], start_ts: i64, end_ts: i64) -> i64 {
    let mut min_ts = TS_MAX;
    for t in inputs {
        if t.timestamp > start_ts && t.timestamp <= end_ts && t.timestamp < min_ts {
            min_ts = t.timestamp;
        }
    }
    min_ts
}

pub struct WindowOp {
    base: NodeBase,
    config: WindowConfig,
    is_event_time: bool,
}

impl std::fmt::Debug for WindowOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowOp")
            .field("is_event_time", &self.is_event_time)
            .finish()
    }
}

impl WindowOp {
    pub fn new(
        name: impl Into<Arc<str>>,
        options: &RuleOptions,
        config: WindowConfig,
    ) -> Result<Self> {
        config.validate(options.is_event_time)?;
        Ok(Self {
            base: NodeBase::new(name, options),
            config,
            is_event_time: options.is_event_time,
        })
    }
}

impl TopoNode for WindowOp {
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
        let run = WindowRun {
            ctx: ctx.clone(),
            outputs: base.outputs,
            send_error: base.send_error,
            config: self.config,
            trigger_time: 0,
        };
        if self.is_event_time {
            spawn_safe(op, err_tx, run.exec_event_window(input));
        } else {
            spawn_safe(op, err_tx, run.exec_processing_window(input));
        }
    }
}

struct WindowRun {
    ctx: NodeContext,
    outputs: Vec<mpsc::Sender<StreamItem>>,
    send_error: bool,
    config: WindowConfig,
    trigger_time: i64,
}

impl WindowRun {
    /// Pre-process one channel item; returns the tuple or watermark to act on.
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
                    "run window error: expect tuple type but got {:?}",
                    other
                ));
                self.ctx.stats.inc_exceptions();
                broadcast(&self.ctx, &self.outputs, StreamItem::Error(e)).await;
                None
            }
        }
    }

    /// Emit the tuples inside the window ending at `end` as one collection
    /// and return the tuples still relevant to future windows.
    ///
    /// Tumbling, hopping and session windows are closed-open: a tuple at
    /// exactly `end` belongs to the next window. Sliding windows are
    /// open-closed so the triggering tuple falls inside its own window.
    async fn scan(&self, inputs: Vec<SharedTuple>, end: i64) -> Vec<SharedTuple> {
        let length = self.config.length_ms();
        let (begin, in_window): (i64, fn(i64, i64, i64) -> bool) = match self.config.window_type {
            WindowType::Session => (self.trigger_time, |ts, _begin, end| ts < end),
            WindowType::Sliding => (
                end - length,
                |ts, begin, end| ts > begin && ts <= end,
            ),
            _ => (end - length, |ts, begin, end| ts >= begin && ts < end),
        };
        let mut content = Vec::new();
        for t in &inputs {
            if in_window(t.timestamp, begin, end) {
                content.push(t.clone());
            }
        }
        debug!(op = %self.ctx.op_id, end, count = content.len(), "window scan");
        if !content.is_empty() {
            let collection = Collection::new(content, WindowRange::new(begin, end));
            broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
        }
        match self.config.window_type {
            WindowType::Sliding => inputs
                .into_iter()
                .filter(|t| t.timestamp > end - length)
                .collect(),
            WindowType::Hopping => {
                let keep_from = end + self.config.interval_ms() - length;
                inputs
                    .into_iter()
                    .filter(|t| t.timestamp >= keep_from)
                    .collect()
            }
            _ => inputs.into_iter().filter(|t| t.timestamp >= end).collect(),
        }
    }

    async fn exec_event_window(mut self, mut input: mpsc::Receiver<StreamItem>) {
        let trigger = match EventTimeTrigger::new(self.config.clone()) {
            Ok(t) => t,
            Err(e) => {
                broadcast(&self.ctx, &self.outputs, StreamItem::Error(e)).await;
                return;
            }
        };
        // Replay buffered inputs from the latest checkpoint.
        let mut inputs: Vec<SharedTuple> = self
            .ctx
            .get_state::<Vec<Tuple>>(WINDOW_INPUTS_KEY)
            .map(|ts| ts.into_iter().map(Arc::new).collect())
            .unwrap_or_default();
        let mut trigger_ts: Vec<i64> = Vec::new();
        let mut delay_ts: Vec<i64> = Vec::new();
        let mut next_window_end: i64 = TS_MAX;
        let mut prev_window_end: i64 = 0;
        let mut last_ticked = false;

        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => {
                    debug!(op = %self.ctx.op_id, "cancelling window");
                    return;
                }
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let Some(item) = self.ingest(item).await else { continue };
                    match item {
                        StreamItem::Watermark(watermark_ts) => {
                            debug!(op = %self.ctx.op_id, watermark_ts, "watermark");
                            if self.config.window_type == WindowType::Sliding {
                                while !delay_ts.is_empty() && watermark_ts >= delay_ts[0] {
                                    inputs = self.scan(inputs, delay_ts[0]).await;
                                    delay_ts.remove(0);
                                }
                            }
                            let mut window_end_ts = next_window_end;
                            let mut ticked = false;
                            // Session and sliding window ends depend on the
                            // inputs, so recalculate them per watermark.
                            if window_end_ts == TS_MAX
                                || self.config.window_type == WindowType::Session
                                || self.config.window_type == WindowType::Sliding
                            {
                                if self.config.window_type == WindowType::Session {
                                    (window_end_ts, ticked) =
                                        trigger.get_next_session_window(&inputs, watermark_ts);
                                } else {
                                    window_end_ts =
                                        trigger.get_next_window(&inputs, prev_window_end, watermark_ts);
                                }
                            }
                            while window_end_ts <= watermark_ts && window_end_ts >= 0 {
                                if self.config.window_type == WindowType::Session && !last_ticked {
                                    if let Some(first) = inputs.first() {
                                        self.trigger_time = first.timestamp;
                                    }
                                }
                                if window_end_ts > 0 {
                                    if self.config.window_type == WindowType::Sliding {
                                        while !trigger_ts.is_empty() && trigger_ts[0] <= watermark_ts {
                                            if self.config.delay_ms() > 0 {
                                                delay_ts.push(trigger_ts[0] + self.config.delay_ms());
                                            } else {
                                                inputs = self.scan(inputs, trigger_ts[0]).await;
                                            }
                                            trigger_ts.remove(0);
                                        }
                                    } else {
                                        inputs = self.scan(inputs, window_end_ts).await;
                                    }
                                }
                                prev_window_end = window_end_ts;
                                last_ticked = ticked;
                                if self.config.window_type == WindowType::Session {
                                    (window_end_ts, ticked) =
                                        trigger.get_next_session_window(&inputs, watermark_ts);
                                } else {
                                    window_end_ts =
                                        trigger.get_next_window(&inputs, prev_window_end, watermark_ts);
                                }
                            }
                            // Deferred emissions scheduled by this watermark's
                            // trigger drain may already be due.
                            if self.config.window_type == WindowType::Sliding {
                                while !delay_ts.is_empty() && watermark_ts >= delay_ts[0] {
                                    inputs = self.scan(inputs, delay_ts[0]).await;
                                    delay_ts.remove(0);
                                }
                            }
                            next_window_end = window_end_ts;
                            self.ctx.put_state(
                                WINDOW_INPUTS_KEY,
                                &inputs.iter().map(|t| t.as_ref().clone()).collect::<Vec<_>>(),
                            );
                        }
                        StreamItem::Tuple(d) => {
                            self.ctx.stats.inc_records_in();
                            // First tuple fixes the initial window start.
                            if self.trigger_time == 0 {
                                self.trigger_time = d.timestamp;
                            }
                            if self.config.window_type == WindowType::Sliding
                                && self.config.matches(&d)
                            {
                                trigger_ts.push(d.timestamp);
                            }
                            inputs.push(d);
                            self.ctx.put_state(
                                WINDOW_INPUTS_KEY,
                                &inputs.iter().map(|t| t.as_ref().clone()).collect::<Vec<_>>(),
                            );
                        }
                        _ => unreachable!("ingest only yields tuples and watermarks"),
                    }
                }
            }
        }
    }

    async fn exec_processing_window(self, input: mpsc::Receiver<StreamItem>) {
        match self.config.window_type {
            WindowType::Count => self.exec_count_window(input).await,
            WindowType::Tumbling => self.exec_ticker_window(input).await,
            WindowType::Session => self.exec_session_window(input).await,
            WindowType::Sliding => self.exec_sliding_window(input).await,
            WindowType::Hopping => self.exec_hopping_window(input).await,
        }
    }

    async fn exec_count_window(self, mut input: mpsc::Receiver<StreamItem>) {
        let mut buffer: Vec<SharedTuple> = Vec::with_capacity(self.config.count_length);
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let Some(StreamItem::Tuple(t)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    buffer.push(t);
                    if buffer.len() >= self.config.count_length {
                        let content = std::mem::take(&mut buffer);
                        let begin = content.first().map(|t| t.timestamp).unwrap_or(0);
                        let collection = Collection::new(content, WindowRange::new(begin, now_ms()));
                        broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
                    }
                }
            }
        }
    }

    async fn exec_ticker_window(self, mut input: mpsc::Receiver<StreamItem>) {
        let mut buffer: Vec<SharedTuple> = Vec::new();
        let mut ticker = tokio::time::interval(self.config.length);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let Some(StreamItem::Tuple(t)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    buffer.push(t);
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        let content = std::mem::take(&mut buffer);
                        let end = now_ms();
                        let collection = Collection::new(
                            content,
                            WindowRange::new(end - self.config.length_ms(), end),
                        );
                        broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
                    }
                }
            }
        }
    }

    async fn exec_sliding_window(self, mut input: mpsc::Receiver<StreamItem>) {
        let mut buffer: Vec<SharedTuple> = Vec::new();
        let (task_tx, mut task_rx) = mpsc::channel::<i64>(1024);
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let Some(StreamItem::Tuple(t)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    let now = now_ms();
                    buffer.push(t.clone());
                    buffer.retain(|x| x.timestamp > now - self.config.length_ms());
                    if self.config.matches(&t) {
                        if self.config.delay_ms() > 0 {
                            let fire_at = now + self.config.delay_ms();
                            let tx = task_tx.clone();
                            let delay = self.config.delay;
                            let token = self.ctx.token.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = token.cancelled() => {}
                                    _ = tokio::time::sleep(delay) => { let _ = tx.send(fire_at).await; }
                                }
                            });
                        } else {
                            let end = now;
                            let content: Vec<SharedTuple> = buffer
                                .iter()
                                .filter(|x| x.timestamp <= end)
                                .cloned()
                                .collect();
                            let collection = Collection::new(
                                content,
                                WindowRange::new(end - self.config.length_ms(), end),
                            );
                            broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
                        }
                    }
                }
                fire_at = task_rx.recv() => {
                    let Some(end) = fire_at else { return };
                    let begin = end - self.config.length_ms();
                    let content: Vec<SharedTuple> = buffer
                        .iter()
                        .filter(|x| x.timestamp > begin && x.timestamp <= end)
                        .cloned()
                        .collect();
                    if !content.is_empty() {
                        let collection = Collection::new(content, WindowRange::new(begin, end));
                        broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
                    }
                }
            }
        }
    }

    async fn exec_hopping_window(self, mut input: mpsc::Receiver<StreamItem>) {
        let mut buffer: Vec<SharedTuple> = Vec::new();
        let mut open_starts: Vec<i64> = Vec::new();
        let (task_tx, mut task_rx) = mpsc::channel::<i64>(1024);
        let mut ticker = tokio::time::interval(self.config.interval);
        // The first window opens immediately; the first tick is consumed by
        // interval() itself.
        self.schedule_hop(&task_tx, now_ms(), &mut open_starts);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let Some(StreamItem::Tuple(t)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    buffer.push(t);
                }
                _ = ticker.tick() => {
                    self.schedule_hop(&task_tx, now_ms(), &mut open_starts);
                }
                start = task_rx.recv() => {
                    let Some(start) = start else { return };
                    let end = start + self.config.length_ms();
                    let content: Vec<SharedTuple> = buffer
                        .iter()
                        .filter(|x| x.timestamp > start && x.timestamp <= end)
                        .cloned()
                        .collect();
                    open_starts.retain(|s| *s != start);
                    let oldest = open_starts.iter().min().copied().unwrap_or(end);
                    buffer.retain(|x| x.timestamp > oldest);
                    if !content.is_empty() {
                        let collection = Collection::new(content, WindowRange::new(start, end));
                        broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
                    }
                }
            }
        }
    }

    /// Open a hopping window at `start`; a deferred task fires its emission
    /// at the window horizon.
    fn schedule_hop(&self, task_tx: &mpsc::Sender<i64>, start: i64, open_starts: &mut Vec<i64>) {
        open_starts.push(start);
        let tx = task_tx.clone();
        let length = self.config.length;
        let token = self.ctx.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(length) => { let _ = tx.send(start).await; }
            }
        });
    }

    async fn exec_session_window(mut self, mut input: mpsc::Receiver<StreamItem>) {
        let mut buffer: Vec<SharedTuple> = Vec::new();
        let timeout = self.config.interval;
        let mut next_tick: Option<i64> = None;
        loop {
            let gap = tokio::time::sleep(timeout);
            tokio::pin!(gap);
            tokio::select! {
                _ = self.ctx.token.cancelled() => return,
                item = input.recv() => {
                    let Some(item) = item else { return };
                    let Some(StreamItem::Tuple(t)) = self.ingest(item).await else { continue };
                    self.ctx.stats.inc_records_in();
                    if buffer.is_empty() {
                        self.trigger_time = t.timestamp;
                        next_tick = Some(get_aligned_window_end_time(
                            t.timestamp,
                            self.config.raw_interval,
                            self.config.time_unit,
                        ));
                    }
                    buffer.push(t);
                    // A length-aligned tick past the current window also
                    // closes it.
                    if let Some(tick) = next_tick {
                        if now_ms() >= tick {
                            self.emit_session(&mut buffer, tick).await;
                            next_tick = None;
                        }
                    }
                }
                _ = &mut gap, if !buffer.is_empty() => {
                    let end = buffer.last().map(|t| t.timestamp).unwrap_or_else(now_ms)
                        + timeout.as_millis() as i64;
                    self.emit_session(&mut buffer, end).await;
                    next_tick = None;
                }
            }
        }
    }

    async fn emit_session(&mut self, buffer: &mut Vec<SharedTuple>, end: i64) {
        if buffer.is_empty() {
            return;
        }
        let content = std::mem::take(buffer);
        let collection = Collection::new(content, WindowRange::new(self.trigger_time, end));
        broadcast(&self.ctx, &self.outputs, StreamItem::Collection(collection)).await;
    }
}
