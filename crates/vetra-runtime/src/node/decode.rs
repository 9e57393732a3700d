//! Decode operator: schema-aware format decoding of raw tuples.

use crate::codec::{Converter, Decoded, Schema, SchemaLayer};
use crate::context::NodeContext;
use crate::error::EngineError;
use crate::node::concurrent::{run_with_order, WorkerFn};
use crate::node::{NodeBase, TopoNode};
use crate::tuple::{StreamItem, Tuple};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use vetra_core::{RuleOptions, Value};

/// Decodes raw tuples into one or more decoded tuples.
///
/// Array payloads expand to one tuple per element, in order; when
/// `send_interval` is set the emissions are spaced by that duration
/// (typically configured by file sources). Any decode failure becomes a
/// single error item in place of the tuple, preserving order.
pub struct DecodeOp {
    base: NodeBase,
    converter: Arc<RwLock<Converter>>,
    schema_layer: Arc<Mutex<SchemaLayer>>,
    send_interval: Option<Duration>,
    /// Payload field supplying the event time; arrival time otherwise.
    timestamp_field: Option<Arc<str>>,
}

/// Handle for shared-stream schema changes while the operator runs.
#[derive(Clone)]
pub struct SchemaHandle {
    converter: Arc<RwLock<Converter>>,
    schema_layer: Arc<Mutex<SchemaLayer>>,
}

impl SchemaHandle {
    /// Merge a rule's schema into the layer and refresh the converter view.
    pub fn attach_schema(&self, rule_id: &str, schema: Option<Schema>, wildcard: bool) {
        let mut layer = self.schema_layer.lock().unwrap();
        layer.merge(rule_id, schema, wildcard);
        let effective = layer.effective();
        info!(rule = rule_id, "attached schema, effective {:?}", effective);
        self.converter.write().unwrap().reset_schema(effective);
    }

    /// Detach a rule's schema, leaving the union of the remaining rules.
    pub fn detach_schema(&self, rule_id: &str) {
        let mut layer = self.schema_layer.lock().unwrap();
        if layer.detach(rule_id) {
            let effective = layer.effective();
            info!(rule = rule_id, "detached schema, effective {:?}", effective);
            self.converter.write().unwrap().reset_schema(effective);
        }
    }
}

impl DecodeOp {
    pub fn new(
        name: impl Into<Arc<str>>,
        options: &RuleOptions,
        rule_id: &str,
        converter: Converter,
        wildcard: bool,
        send_interval: Option<Duration>,
    ) -> Self {
        let schema = converter.schema().cloned();
        Self {
            base: NodeBase::new(name, options),
            converter: Arc::new(RwLock::new(converter)),
            schema_layer: Arc::new(Mutex::new(SchemaLayer::new(rule_id, schema, wildcard))),
            send_interval,
            timestamp_field: None,
        }
    }

    /// Stamp decoded tuples with the event time found in this payload field.
    pub fn with_timestamp_field(mut self, field: impl Into<Arc<str>>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    pub fn schema_handle(&self) -> SchemaHandle {
        SchemaHandle {
            converter: self.converter.clone(),
            schema_layer: self.schema_layer.clone(),
        }
    }

    fn worker(converter: Arc<RwLock<Converter>>, timestamp_field: Option<Arc<str>>) -> WorkerFn {
        Arc::new(move |_ctx, item| {
            let StreamItem::Tuple(t) = &item else {
                return vec![StreamItem::Error(EngineError::Fatal(format!(
                    "decode expects tuples but got {:?}",
                    item
                )))];
            };
            // Boundary markers pass through untouched.
            if t.is_control() {
                return vec![item];
            }
            let Some(raw) = &t.raw else {
                return vec![StreamItem::Error(EngineError::decode(
                    "decode received a tuple without raw payload".to_string(),
                ))];
            };
            let decoded = { converter.read().unwrap().decode(raw) };
            let ts_field = timestamp_field.as_deref();
            match decoded {
                Ok(Decoded::One(map)) => {
                    vec![StreamItem::tuple(to_tuple(map, t, ts_field))]
                }
                Ok(Decoded::Many(values)) => values
                    .into_iter()
                    .map(|v| match v {
                        Value::Map(m) => {
                            let conv = converter.read().unwrap();
                            let map = conv.project(m.into_iter());
                            StreamItem::tuple(to_tuple(map, t, ts_field))
                        }
                        other => StreamItem::Error(EngineError::decode(format!(
                            "only map inside a list is supported but got: {}",
                            other
                        ))),
                    })
                    .collect(),
                Err(e) => vec![StreamItem::Error(e)],
            }
        })
    }
}

/// Decoded tuples reuse the raw tuple's metadata, timestamp and emitter;
/// a configured timestamp field overrides the arrival time.
fn to_tuple(
    map: crate::tuple::FxIndexMap<Arc<str>, Value>,
    raw: &Tuple,
    ts_field: Option<&str>,
) -> Tuple {
    let timestamp = ts_field
        .and_then(|f| map.get(f).and_then(|v| v.as_int()))
        .unwrap_or(raw.timestamp);
    Tuple {
        emitter: raw.emitter.clone(),
        timestamp,
        payload: map,
        raw: None,
        metadata: raw.metadata.clone(),
    }
}

impl TopoNode for DecodeOp {
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
        let wf = DecodeOp::worker(self.converter, self.timestamp_field);
        run_with_order(
            ctx,
            input,
            base.outputs,
            err_tx,
            base.concurrency,
            base.send_error,
            wf,
            self.send_interval,
        );
    }
}
