//! End-to-end pipeline scenarios: source → decode → window → aggregate →
//! sink topologies driven through the public API.

use std::sync::Arc;
use std::time::Duration;

use vetra_core::{Rule, RuleOptions, Value};
use vetra_runtime::aggregation::{AggField, IncFunc};
use vetra_runtime::checkpoint::CheckpointStore;
use vetra_runtime::codec::{Converter, Format};
use vetra_runtime::connection::PropMap;
use vetra_runtime::connector::{MemoryBroker, MemorySink, MemorySource};
use vetra_runtime::node::aggregate::AggregateOp;
use vetra_runtime::node::decode::DecodeOp;
use vetra_runtime::node::inc_agg::WindowIncAggOp;
use vetra_runtime::node::sink::{SinkConf, SinkNode};
use vetra_runtime::node::source::SourceNode;
use vetra_runtime::node::watermark::WatermarkOp;
use vetra_runtime::node::window::{TimeUnit, WindowConfig, WindowOp};
use vetra_runtime::persistence::{FileKv, KvStore};
use vetra_runtime::rule::RuleRegistry;
use vetra_runtime::topology::{Planner, Topology};
use vetra_runtime::transform::Transform;
use vetra_runtime::Result;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn props(entries: &[(&str, &str)]) -> PropMap {
    let mut p = PropMap::new();
    for (k, v) in entries {
        p.insert(k.to_string(), Value::Str(v.to_string()));
    }
    p
}

fn sink_conf() -> SinkConf {
    SinkConf::new(Transform::new(None, vec![], Converter::new(Format::Json, None)).unwrap())
}

async fn recv_json(
    rx: &mut tokio::sync::broadcast::Receiver<Vec<u8>>,
) -> serde_json::Value {
    let bytes = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for sink output")
        .expect("sink channel closed");
    serde_json::from_slice(&bytes).expect("sink payload is json")
}

/// Tumbling event-time windows over a single integer stream, grouped per
/// window, delivered to a memory sink.
#[tokio::test]
async fn event_time_tumbling_pipeline() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let options = RuleOptions {
        is_event_time: true,
        late_tolerance: 0,
        checkpoint_interval: 0,
        ..Default::default()
    };

    let mut topo = Topology::new("tumbling_rule", options.clone());
    let source = SourceNode::new(
        "demo",
        MemorySource::boxed(broker.clone()),
        &props(&[("datasource", "in")]),
        &options,
    )
    .unwrap();
    topo.add_source(Box::new(source)).unwrap();

    let decode = DecodeOp::new(
        "decode",
        &options,
        "tumbling_rule",
        Converter::new(Format::Json, None),
        true,
        None,
    )
    .with_timestamp_field("ts");
    topo.add_operator(Box::new(decode)).unwrap();

    topo.add_operator(Box::new(WatermarkOp::new("watermark", &options)))
        .unwrap();

    let window = WindowOp::new(
        "window",
        &options,
        WindowConfig::tumbling(Duration::from_secs(1), 1, TimeUnit::Second),
    )
    .unwrap();
    topo.add_operator(Box::new(window)).unwrap();

    topo.add_operator(Box::new(AggregateOp::new(
        "aggregate",
        &options,
        vec!["window_end".to_string()],
    )))
    .unwrap();

    let sink = SinkNode::new(
        "out",
        &options,
        MemorySink::boxed(broker.clone()),
        &props(&[("topic", "results")]),
        sink_conf(),
    )
    .unwrap();
    topo.add_operator(Box::new(sink)).unwrap();

    topo.connect("demo", "decode").unwrap();
    topo.connect("decode", "watermark").unwrap();
    topo.connect("watermark", "window").unwrap();
    topo.connect("window", "aggregate").unwrap();
    topo.connect("aggregate", "out").unwrap();

    let mut results = broker.subscribe("results");
    let _err_rx = topo.open().unwrap();
    // Let the source establish its subscription before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (ts, v) in [(0, 1), (300, 2), (700, 3), (1200, 4), (2100, 99)] {
        broker.publish("in", format!(r#"{{"ts": {}, "v": {}}}"#, ts, v).into_bytes());
    }

    // Watermark 1200 closes [0, 1000); watermark 2100 closes [1000, 2000).
    let first = recv_json(&mut results).await;
    let vs: Vec<i64> = first
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["v"].as_i64().unwrap())
        .collect();
    assert_eq!(vs, vec![1, 2, 3]);

    let second = recv_json(&mut results).await;
    let vs: Vec<i64> = second
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["v"].as_i64().unwrap())
        .collect();
    assert_eq!(vs, vec![4]);

    topo.cancel();
}

/// Count-window incremental aggregation with a dimension, end to end.
#[tokio::test]
async fn count_window_incremental_aggregation_pipeline() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let options = RuleOptions {
        checkpoint_interval: 0,
        ..Default::default()
    };

    let mut topo = Topology::new("count_rule", options.clone());
    let source = SourceNode::new(
        "demo",
        MemorySource::boxed(broker.clone()),
        &props(&[("datasource", "count_in")]),
        &options,
    )
    .unwrap();
    topo.add_source(Box::new(source)).unwrap();

    let decode = DecodeOp::new(
        "decode",
        &options,
        "count_rule",
        Converter::new(Format::Json, None),
        true,
        None,
    );
    topo.add_operator(Box::new(decode)).unwrap();

    let inc = WindowIncAggOp::new(
        "inc_window",
        &options,
        WindowConfig::count(4),
        vec!["key".to_string()],
        vec![AggField::new("total", IncFunc::Sum, Some("v".to_string()))],
    )
    .unwrap();
    topo.add_operator(Box::new(inc)).unwrap();

    let sink = SinkNode::new(
        "out",
        &options,
        MemorySink::boxed(broker.clone()),
        &props(&[("topic", "count_results")]),
        sink_conf(),
    )
    .unwrap();
    topo.add_operator(Box::new(sink)).unwrap();

    topo.connect("demo", "decode").unwrap();
    topo.connect("decode", "inc_window").unwrap();
    topo.connect("inc_window", "out").unwrap();

    let mut results = broker.subscribe("count_results");
    let _err_rx = topo.open().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (key, v) in [("A", 1), ("B", 2), ("A", 3), ("B", 4)] {
        broker.publish(
            "count_in",
            format!(r#"{{"key": "{}", "v": {}}}"#, key, v).into_bytes(),
        );
    }

    let out = recv_json(&mut results).await;
    let rows = out.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    let a = rows.iter().find(|r| r["key"] == "A").unwrap();
    let b = rows.iter().find(|r| r["key"] == "B").unwrap();
    // Each dimension's last row carries the running sum.
    assert_eq!(a["total"], 4.0);
    assert_eq!(a["v"], 3);
    assert_eq!(b["total"], 6.0);
    assert_eq!(b["v"], 4);

    topo.cancel();
}

/// Rules created through the registry run, stop and restart cleanly.
struct MemoryPipelinePlanner {
    broker: Arc<MemoryBroker>,
    in_topic: String,
    out_topic: String,
}

impl Planner for MemoryPipelinePlanner {
    fn plan(&self, rule: &Rule) -> Result<Topology> {
        let options = rule.options.clone();
        let mut topo = Topology::new(rule.id.clone(), options.clone());
        let source = SourceNode::new(
            "src",
            MemorySource::boxed(self.broker.clone()),
            &props(&[("datasource", &self.in_topic)]),
            &options,
        )?;
        topo.add_source(Box::new(source))?;
        let decode = DecodeOp::new(
            "decode",
            &options,
            &rule.id,
            Converter::new(Format::Json, None),
            true,
            None,
        );
        topo.add_operator(Box::new(decode))?;
        let sink = SinkNode::new(
            "out",
            &options,
            MemorySink::boxed(self.broker.clone()),
            &props(&[("topic", &self.out_topic)]),
            sink_conf(),
        )?;
        topo.add_operator(Box::new(sink))?;
        topo.connect("src", "decode")?;
        topo.connect("decode", "out")?;
        Ok(topo)
    }
}

#[tokio::test]
async fn registry_lifecycle_passthrough_pipeline() {
    init_tracing();
    let broker = Arc::new(MemoryBroker::new());
    let registry = RuleRegistry::new(Arc::new(MemoryPipelinePlanner {
        broker: broker.clone(),
        in_topic: "life_in".to_string(),
        out_topic: "life_out".to_string(),
    }));

    let mut rule = Rule::new("life");
    rule.options.checkpoint_interval = 0;
    registry.create_rule(rule).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut results = broker.subscribe("life_out");
    broker.publish("life_in", br#"{"v": 1}"#.to_vec());
    assert_eq!(recv_json(&mut results).await, serde_json::json!({"v": 1}));

    // While stopped, nothing flows.
    registry.stop_rule("life").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.publish("life_in", br#"{"v": 2}"#.to_vec());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(results.try_recv().is_err());

    // A restart re-plans a fresh topology.
    registry.start_rule("life").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.publish("life_in", br#"{"v": 3}"#.to_vec());
    assert_eq!(recv_json(&mut results).await, serde_json::json!({"v": 3}));

    registry.delete_rule("life").unwrap();
    assert!(registry.get("life").is_err());
}

/// Checkpoint staging and replay across a simulated engine restart, against
/// the durable file store.
#[tokio::test]
async fn checkpoint_replay_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let kv: Arc<dyn KvStore> = Arc::new(FileKv::open(&path).unwrap());
        let store = CheckpointStore::open("cp_rule", kv).unwrap();
        store.save_state(1, "window", state_with("count", serde_json::json!(10)));
        store.save_state(1, "sink", state_with("offset", serde_json::json!(5)));
        store.save_checkpoint(1).unwrap();
        store.save_state(2, "window", state_with("count", serde_json::json!(20)));
        store.save_checkpoint(2).unwrap();
    }

    // Restart: only the newest completed checkpoint is visible.
    let kv: Arc<dyn KvStore> = Arc::new(FileKv::open(&path).unwrap());
    let store = CheckpointStore::open("cp_rule", kv).unwrap();
    assert_eq!(
        store.get_op_state("window").get("count"),
        Some(&serde_json::json!(20))
    );
    assert!(store.get_op_state("sink").is_empty());
}

fn state_with(key: &str, value: serde_json::Value) -> vetra_runtime::context::StateMap {
    let mut m = vetra_runtime::context::StateMap::default();
    m.insert(key.to_string(), value);
    m
}
