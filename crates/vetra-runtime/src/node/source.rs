//! Source node: ingests external payloads and emits stamped tuples.

use crate::connection::PropMap;
use crate::context::NodeContext;
use crate::error::{EngineError, Result};
use crate::node::{broadcast, drain_error, spawn_safe, TopoNode};
use crate::tuple::{FxIndexMap, StreamItem, Tuple};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vetra_core::{RuleOptions, Value};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One delivery from a subscription.
#[derive(Debug)]
pub enum IngestPayload {
    /// Raw bytes to be decoded downstream.
    Bytes(Vec<u8>),
    /// Already-structured payload from a structured source.
    Decoded(FxIndexMap<Arc<str>, Value>),
    /// A boundary marker (e.g. end of a file); becomes a control tuple.
    Boundary,
}

#[derive(Debug)]
enum IngestItem {
    Payload {
        payload: IngestPayload,
        metadata: FxIndexMap<Arc<str>, Value>,
        timestamp: Option<i64>,
    },
    Error(EngineError),
}

/// Callback handle given to a source subscription.
#[derive(Clone)]
pub struct Ingest {
    tx: mpsc::Sender<IngestItem>,
    token: CancellationToken,
}

impl Ingest {
    pub async fn ingest(
        &self,
        payload: IngestPayload,
        metadata: FxIndexMap<Arc<str>, Value>,
        timestamp: Option<i64>,
    ) {
        let item = IngestItem::Payload {
            payload,
            metadata,
            timestamp,
        };
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.send(item) => {}
        }
    }

    pub async fn error(&self, err: EngineError) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.send(IngestItem::Error(err)) => {}
        }
    }
}

/// Contract implemented by every source connector.
#[async_trait]
pub trait Source: Send {
    /// Validate and absorb properties. Called once at node construction; an
    /// empty or invalid datasource fails the plan immediately.
    fn provision(&mut self, props: &PropMap) -> Result<()>;

    async fn connect(&mut self) -> Result<()>;

    /// Start delivering payloads through the ingest handle. Returns once the
    /// subscription is established; delivery happens on background tasks or
    /// inside the connector until `close`.
    async fn subscribe(&mut self, ingest: Ingest) -> Result<()>;

    async fn close(&mut self);
}

pub struct SourceNode {
    name: Arc<str>,
    outputs: Vec<mpsc::Sender<StreamItem>>,
    source: Box<dyn Source>,
    buffer_length: usize,
    send_error: bool,
}

impl std::fmt::Debug for SourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceNode")
            .field("name", &self.name)
            .field("buffer_length", &self.buffer_length)
            .field("send_error", &self.send_error)
            .finish()
    }
}

impl SourceNode {
    /// Provisions the source at construction.
    pub fn new(
        name: impl Into<Arc<str>>,
        mut source: Box<dyn Source>,
        props: &PropMap,
        options: &RuleOptions,
    ) -> Result<Self> {
        source.provision(props)?;
        Ok(Self {
            name: name.into(),
            outputs: Vec::new(),
            source,
            buffer_length: options.buffer_length.max(1),
            send_error: options.send_error,
        })
    }
}

impl TopoNode for SourceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<mpsc::Sender<StreamItem>> {
        None
    }

    fn add_output(&mut self, tx: mpsc::Sender<StreamItem>) {
        self.outputs.push(tx);
    }

    fn spawn(self: Box<Self>, ctx: NodeContext, err_tx: mpsc::Sender<EngineError>) {
        let SourceNode {
            name,
            outputs,
            mut source,
            buffer_length,
            send_error,
        } = *self;

        let op = name.clone();
        spawn_safe(op, err_tx.clone(), async move {
            if let Err(e) = source.connect().await {
                // Surface once; stay dormant until the restart strategy
                // re-opens the topology.
                warn!(source = %name, "connect failed: {}", e);
                ctx.stats.inc_exceptions();
                drain_error(&err_tx, e);
                return;
            }
            info!(source = %name, "source connected");

            let (ingest_tx, mut ingest_rx) = mpsc::channel(buffer_length);
            let ingest = Ingest {
                tx: ingest_tx,
                token: ctx.token.clone(),
            };
            if let Err(e) = source.subscribe(ingest).await {
                warn!(source = %name, "subscribe failed: {}", e);
                ctx.stats.inc_exceptions();
                drain_error(&err_tx, e);
                source.close().await;
                return;
            }

            loop {
                tokio::select! {
                    _ = ctx.token.cancelled() => {
                        debug!(source = %name, "source cancelled");
                        source.close().await;
                        return;
                    }
                    item = ingest_rx.recv() => {
                        let Some(item) = item else {
                            source.close().await;
                            return;
                        };
                        match item {
                            IngestItem::Payload { payload, metadata, timestamp } => {
                                let ts = timestamp.unwrap_or_else(now_ms);
                                let tuple = match payload {
                                    IngestPayload::Bytes(b) => {
                                        Tuple::raw(name.clone(), b, metadata, ts)
                                    }
                                    IngestPayload::Decoded(map) => {
                                        Tuple::decoded(name.clone(), map, ts)
                                            .with_metadata(metadata)
                                    }
                                    IngestPayload::Boundary => {
                                        Tuple::control(name.clone(), metadata, ts)
                                    }
                                };
                                ctx.stats.inc_records_in();
                                broadcast(&ctx, &outputs, StreamItem::tuple(tuple)).await;
                            }
                            IngestItem::Error(e) => {
                                ctx.stats.inc_exceptions();
                                if send_error {
                                    broadcast(&ctx, &outputs, StreamItem::Error(e)).await;
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ERROR_CHANNEL_CAPACITY;
    use indexmap::IndexMap;
    use rustc_hash::FxBuildHasher;

    struct ScriptedSource {
        fail_connect: bool,
        deliveries: Vec<IngestPayload>,
    }

    #[async_trait]
    impl Source for ScriptedSource {
        fn provision(&mut self, props: &PropMap) -> Result<()> {
            if props.get("datasource").and_then(|v| v.as_str()).is_none() {
                return Err(EngineError::Plan("datasource is required".to_string()));
            }
            Ok(())
        }

        async fn connect(&mut self) -> Result<()> {
            if self.fail_connect {
                Err(EngineError::io("connection refused"))
            } else {
                Ok(())
            }
        }

        async fn subscribe(&mut self, ingest: Ingest) -> Result<()> {
            let deliveries = std::mem::take(&mut self.deliveries);
            tokio::spawn(async move {
                for payload in deliveries {
                    ingest
                        .ingest(payload, IndexMap::with_hasher(FxBuildHasher), None)
                        .await;
                }
            });
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn props() -> PropMap {
        let mut p = PropMap::new();
        p.insert("datasource".to_string(), Value::Str("demo".to_string()));
        p
    }

    #[test]
    fn test_provision_failure_fails_construction() {
        let src = Box::new(ScriptedSource {
            fail_connect: false,
            deliveries: vec![],
        });
        let err = SourceNode::new("s", src, &PropMap::new(), &RuleOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::Plan(_)));
    }

    #[tokio::test]
    async fn test_emits_raw_and_control_tuples() {
        let src = Box::new(ScriptedSource {
            fail_connect: false,
            deliveries: vec![
                IngestPayload::Bytes(b"payload".to_vec()),
                IngestPayload::Boundary,
            ],
        });
        let mut node = SourceNode::new("s1", src, &props(), &RuleOptions::default()).unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        node.add_output(out_tx);

        let ctx = NodeContext::new("r", "s1");
        let (err_tx, _err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Box::new(node).spawn(ctx.clone(), err_tx);

        match out_rx.recv().await.unwrap() {
            StreamItem::Tuple(t) => {
                assert!(t.is_raw());
                assert_eq!(&*t.emitter, "s1");
                assert!(t.timestamp > 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match out_rx.recv().await.unwrap() {
            StreamItem::Tuple(t) => assert!(t.is_control()),
            other => panic!("unexpected {:?}", other),
        }
        ctx.token.cancel();
    }

    #[tokio::test]
    async fn test_connect_error_surfaces_once() {
        let src = Box::new(ScriptedSource {
            fail_connect: true,
            deliveries: vec![],
        });
        let mut node = SourceNode::new("s1", src, &props(), &RuleOptions::default()).unwrap();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        node.add_output(out_tx);

        let ctx = NodeContext::new("r", "s1");
        let (err_tx, mut err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Box::new(node).spawn(ctx.clone(), err_tx);

        let err = err_rx.recv().await.unwrap();
        assert!(err.is_io_error());
        // Node is dormant: no tuples are emitted.
        assert!(out_rx.try_recv().is_err());
        ctx.token.cancel();
    }
}
