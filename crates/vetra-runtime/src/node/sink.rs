//! Sink node: transform, encode and deliver results, with a resend queue
//! for retryable delivery failures.

use crate::connection::PropMap;
use crate::context::NodeContext;
use crate::error::{EngineError, Result};
use crate::node::source::now_ms;
use crate::node::{drain_error, spawn_safe, NodeBase, TopoNode};
use crate::transform::Transform;
use crate::tuple::{FxIndexMap, StreamItem};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vetra_core::{RuleOptions, Value};

/// Contract implemented by every sink connector.
#[async_trait]
pub trait Sink: Send {
    fn provision(&mut self, props: &PropMap) -> Result<()>;

    async fn connect(&mut self) -> Result<()>;

    /// Deliver one encoded payload.
    async fn collect(&mut self, payload: &[u8]) -> Result<()>;

    /// Deliver a payload from the resend queue. Defaults to `collect`.
    async fn collect_resend(&mut self, payload: &[u8]) -> Result<()> {
        self.collect(payload).await
    }

    async fn close(&mut self);
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").finish()
    }
}

/// Sink-stage configuration.
#[derive(Clone)]
pub struct SinkConf {
    pub transform: Transform,
    /// Deliver each row of a collection separately instead of one array
    /// payload.
    pub send_single: bool,
    /// Attach tuple metadata to the payload under `meta`.
    pub send_meta: bool,
    /// Resend queue capacity; 0 disables resending.
    pub resend_capacity: usize,
    /// Drain rate of the resend queue.
    pub resend_interval: Duration,
}

impl SinkConf {
    pub fn new(transform: Transform) -> Self {
        Self {
            transform,
            send_single: false,
            send_meta: false,
            resend_capacity: 0,
            resend_interval: Duration::from_secs(1),
        }
    }

    pub fn with_resend(mut self, capacity: usize, interval: Duration) -> Self {
        self.resend_capacity = capacity;
        self.resend_interval = interval;
        self
    }
}

pub struct SinkNode {
    base: NodeBase,
    sink: Box<dyn Sink>,
    conf: SinkConf,
}

impl SinkNode {
    /// Provisions the sink at construction.
    pub fn new(
        name: impl Into<Arc<str>>,
        options: &RuleOptions,
        mut sink: Box<dyn Sink>,
        props: &PropMap,
        mut conf: SinkConf,
    ) -> Result<Self> {
        sink.provision(props)?;
        conf.send_meta = options.send_meta_to_sink;
        Ok(Self {
            base: NodeBase::new(name, options),
            sink,
            conf,
        })
    }
}

impl TopoNode for SinkNode {
    fn name(&self) -> &str {
        &self.base.name
    }

    fn input(&self) -> Option<mpsc::Sender<StreamItem>> {
        Some(self.base.input())
    }

    fn add_output(&mut self, _tx: mpsc::Sender<StreamItem>) {
        // Sinks are terminal.
    }

    fn spawn(self: Box<Self>, ctx: NodeContext, err_tx: mpsc::Sender<EngineError>) {
        let mut base = self.base;
        let mut input = base.take_input();
        let mut sink = self.sink;
        let conf = self.conf;
        let name = base.name.clone();

        spawn_safe(name.clone(), err_tx.clone(), async move {
            if let Err(e) = sink.connect().await {
                warn!(sink = %name, "connect failed: {}", e);
                ctx.stats.inc_exceptions();
                drain_error(&err_tx, e);
                return;
            }
            info!(sink = %name, "sink connected");

            let mut resend_queue: VecDeque<Vec<u8>> = VecDeque::new();
            let mut ticker = tokio::time::interval(conf.resend_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.token.cancelled() => {
                        sink.close().await;
                        return;
                    }
                    item = input.recv() => {
                        let Some(item) = item else {
                            sink.close().await;
                            return;
                        };
                        ctx.stats.set_buffer_length(input.len() as i64);
                        let payloads = match encode_item(&conf, &item) {
                            Ok(p) => p,
                            Err(e) => {
                                ctx.stats.inc_exceptions();
                                debug!(sink = %name, "transform failed: {}", e);
                                continue;
                            }
                        };
                        let Some(payloads) = payloads else { continue };
                        ctx.stats.inc_records_in();
                        for payload in payloads {
                            match sink.collect(&payload).await {
                                Ok(()) => ctx.stats.inc_records_out(),
                                Err(e) if e.is_retryable() && conf.resend_capacity > 0 => {
                                    debug!(sink = %name, "queueing payload for resend: {}", e);
                                    if resend_queue.len() >= conf.resend_capacity {
                                        resend_queue.pop_front();
                                        ctx.stats.inc_exceptions();
                                    }
                                    resend_queue.push_back(payload);
                                }
                                Err(e) => {
                                    ctx.stats.inc_exceptions();
                                    warn!(sink = %name, "delivery failed: {}", e);
                                }
                            }
                        }
                        ctx.stats.inc_messages_processed();
                    }
                    _ = ticker.tick(), if !resend_queue.is_empty() => {
                        if let Some(payload) = resend_queue.pop_front() {
                            match sink.collect_resend(&payload).await {
                                Ok(()) => ctx.stats.inc_records_out(),
                                Err(e) if e.is_retryable() => {
                                    resend_queue.push_front(payload);
                                }
                                Err(e) => {
                                    ctx.stats.inc_exceptions();
                                    warn!(sink = %name, "resend failed: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

fn tuple_map(conf: &SinkConf, t: &crate::tuple::Tuple) -> FxIndexMap<Arc<str>, Value> {
    let mut map = t.payload.clone();
    if conf.send_meta && !t.metadata.is_empty() {
        let meta: indexmap::IndexMap<String, Value> = t
            .metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        map.insert(Arc::from("meta"), Value::Map(meta));
    }
    map
}

/// Encode one stream item into zero or more deliverable payloads.
/// `Ok(None)` means the item produces no delivery (control items).
fn encode_item(conf: &SinkConf, item: &StreamItem) -> Result<Option<Vec<Vec<u8>>>> {
    let (rows, is_collection): (Vec<FxIndexMap<Arc<str>, Value>>, bool) = match item {
        StreamItem::Tuple(t) => (vec![tuple_map(conf, t)], false),
        StreamItem::Collection(c) => (c.iter().map(|t| tuple_map(conf, t)).collect(), true),
        StreamItem::Grouped(set) => (
            set.groups
                .iter()
                .flat_map(|g| g.content.iter().map(|t| tuple_map(conf, t)))
                .collect(),
            true,
        ),
        StreamItem::Error(e) => {
            // Error items reaching a sink are delivered as error records.
            let mut map: FxIndexMap<Arc<str>, Value> =
                indexmap::IndexMap::with_hasher(rustc_hash::FxBuildHasher);
            map.insert(Arc::from("error"), Value::Str(e.to_string()));
            map.insert(Arc::from("timestamp"), Value::Int(now_ms()));
            (vec![map], false)
        }
        StreamItem::Watermark(_) | StreamItem::Eof => return Ok(None),
    };
    if rows.is_empty() {
        return Ok(None);
    }

    let mut parts = Vec::with_capacity(rows.len());
    for row in &rows {
        let (bytes, _) = conf.transform.apply(row, true)?;
        parts.push(bytes);
    }

    if conf.send_single || !is_collection {
        Ok(Some(parts))
    } else {
        // Collections deliver one array payload; field selection applied
        // per row.
        let mut payload = Vec::new();
        payload.push(b'[');
        for (i, p) in parts.iter().enumerate() {
            if i > 0 {
                payload.push(b',');
            }
            payload.extend_from_slice(p);
        }
        payload.push(b']');
        Ok(Some(vec![payload]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Converter, Format};
    use crate::node::ERROR_CHANNEL_CAPACITY;
    use crate::tuple::{Collection, Tuple, WindowRange};
    use indexmap::IndexMap;
    use rustc_hash::FxBuildHasher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct SharedLog {
        payloads: Mutex<Vec<Vec<u8>>>,
        fail_next: AtomicUsize,
    }

    struct RecordingSink {
        log: Arc<SharedLog>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn provision(&mut self, _props: &PropMap) -> Result<()> {
            Ok(())
        }

        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn collect(&mut self, payload: &[u8]) -> Result<()> {
            if self.log.fail_next.load(Ordering::SeqCst) > 0 {
                self.log.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::io("broker unavailable"));
            }
            self.log.payloads.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn tuple(v: i64) -> StreamItem {
        StreamItem::tuple(
            Tuple::decoded("t", IndexMap::with_hasher(FxBuildHasher), v).with_field("v", v),
        )
    }

    fn conf() -> SinkConf {
        SinkConf::new(
            Transform::new(None, vec![], Converter::new(Format::Json, None)).unwrap(),
        )
    }

    async fn spawn_sink(
        conf: SinkConf,
        options: RuleOptions,
        log: Arc<SharedLog>,
    ) -> (mpsc::Sender<StreamItem>, NodeContext) {
        let sink = Box::new(RecordingSink { log });
        let node = SinkNode::new("sink", &options, sink, &PropMap::new(), conf).unwrap();
        let input = node.input().unwrap();
        let ctx = NodeContext::new("r", "sink");
        let (err_tx, _err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Box::new(node).spawn(ctx.clone(), err_tx);
        (input, ctx)
    }

    async fn wait_for<F: Fn() -> bool>(pred: F) {
        for _ in 0..100 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_delivers_encoded_tuple() {
        let log = Arc::new(SharedLog::default());
        let (input, ctx) = spawn_sink(conf(), RuleOptions::default(), log.clone()).await;
        input.send(tuple(7)).await.unwrap();
        wait_for(|| !log.payloads.lock().unwrap().is_empty()).await;
        let payloads = log.payloads.lock().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(v, serde_json::json!({"v": 7}));
        ctx.token.cancel();
    }

    #[tokio::test]
    async fn test_collection_as_single_array_payload() {
        let log = Arc::new(SharedLog::default());
        let (input, ctx) = spawn_sink(conf(), RuleOptions::default(), log.clone()).await;

        let mut c = Collection::with_capacity(2);
        for v in [1i64, 2] {
            if let StreamItem::Tuple(t) = tuple(v) {
                c.add(t);
            }
        }
        c.range = Some(WindowRange::new(0, 10));
        input.send(StreamItem::Collection(c)).await.unwrap();

        wait_for(|| !log.payloads.lock().unwrap().is_empty()).await;
        let payloads = log.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(v, serde_json::json!([{"v": 1}, {"v": 2}]));
        ctx.token.cancel();
    }

    #[tokio::test]
    async fn test_send_single_delivers_per_row() {
        let log = Arc::new(SharedLog::default());
        let mut c = conf();
        c.send_single = true;
        let (input, ctx) = spawn_sink(c, RuleOptions::default(), log.clone()).await;

        let mut coll = Collection::with_capacity(2);
        for v in [1i64, 2] {
            if let StreamItem::Tuple(t) = tuple(v) {
                coll.add(t);
            }
        }
        input.send(StreamItem::Collection(coll)).await.unwrap();
        wait_for(|| log.payloads.lock().unwrap().len() == 2).await;
        ctx.token.cancel();
    }

    #[tokio::test]
    async fn test_retryable_failure_resends() {
        let log = Arc::new(SharedLog::default());
        log.fail_next.store(1, Ordering::SeqCst);
        let c = conf().with_resend(8, Duration::from_millis(20));
        let (input, ctx) = spawn_sink(c, RuleOptions::default(), log.clone()).await;

        input.send(tuple(5)).await.unwrap();
        // First attempt fails, the resend loop delivers it.
        wait_for(|| !log.payloads.lock().unwrap().is_empty()).await;
        let payloads = log.payloads.lock().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(v, serde_json::json!({"v": 5}));
        ctx.token.cancel();
    }

    #[tokio::test]
    async fn test_send_meta_attaches_metadata() {
        let log = Arc::new(SharedLog::default());
        let options = RuleOptions {
            send_meta_to_sink: true,
            ..Default::default()
        };
        let (input, ctx) = spawn_sink(conf(), options, log.clone()).await;

        let mut meta = IndexMap::with_hasher(FxBuildHasher);
        meta.insert(Arc::from("topic"), Value::Str("sensors/1".to_string()));
        let t = Tuple::decoded("t", IndexMap::with_hasher(FxBuildHasher), 0)
            .with_field("v", 1i64)
            .with_metadata(meta);
        input.send(StreamItem::tuple(t)).await.unwrap();

        wait_for(|| !log.payloads.lock().unwrap().is_empty()).await;
        let payloads = log.payloads.lock().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(v["meta"]["topic"], "sensors/1");
        ctx.token.cancel();
    }
}
