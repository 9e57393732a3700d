//! Tuple and collection types flowing through topologies.

use crate::error::EngineError;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vetra_core::Value;

/// Type alias for field name keys using Arc<str> for O(1) cloning.
pub type FieldKey = Arc<str>;

/// Type alias for IndexMap with FxBuildHasher for faster hashing of payload fields.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// A shared reference to a tuple. Tuples are immutable after emission, so
/// downstream fan-out clones the Arc, never the payload.
pub type SharedTuple = Arc<Tuple>;

/// A record flowing through a topology.
///
/// A "raw" tuple carries `raw` bytes and an empty payload; the decode
/// operator turns it into a "decoded" tuple carrying the payload map. A
/// control tuple (connector boundary marker) carries metadata only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuple {
    /// Name of the node that emitted this tuple.
    pub emitter: Arc<str>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub payload: FxIndexMap<Arc<str>, Value>,
    #[serde(default)]
    pub raw: Option<Vec<u8>>,
    #[serde(default)]
    pub metadata: FxIndexMap<Arc<str>, Value>,
}

impl Tuple {
    pub fn raw(
        emitter: impl Into<Arc<str>>,
        raw: Vec<u8>,
        metadata: FxIndexMap<Arc<str>, Value>,
        timestamp: i64,
    ) -> Self {
        Self {
            emitter: emitter.into(),
            timestamp,
            payload: IndexMap::with_hasher(FxBuildHasher),
            raw: Some(raw),
            metadata,
        }
    }

    pub fn decoded(
        emitter: impl Into<Arc<str>>,
        payload: FxIndexMap<Arc<str>, Value>,
        timestamp: i64,
    ) -> Self {
        Self {
            emitter: emitter.into(),
            timestamp,
            payload,
            raw: None,
            metadata: IndexMap::with_hasher(FxBuildHasher),
        }
    }

    /// A boundary marker tuple carrying metadata only. Used by file and
    /// connector sources to signal e.g. end of a file.
    pub fn control(
        emitter: impl Into<Arc<str>>,
        metadata: FxIndexMap<Arc<str>, Value>,
        timestamp: i64,
    ) -> Self {
        Self {
            emitter: emitter.into(),
            timestamp,
            payload: IndexMap::with_hasher(FxBuildHasher),
            raw: None,
            metadata,
        }
    }

    pub fn with_metadata(mut self, metadata: FxIndexMap<Arc<str>, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_field(mut self, key: impl Into<Arc<str>>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn is_raw(&self) -> bool {
        self.raw.is_some()
    }

    /// Control tuples carry neither raw bytes nor a payload.
    pub fn is_control(&self) -> bool {
        self.raw.is_none() && self.payload.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(|v| v.as_float())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(|v| v.as_int())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Set a payload field in place. Only valid before emission; downstream
    /// mutation goes through a clone.
    pub fn set(&mut self, key: impl Into<Arc<str>>, value: Value) {
        self.payload.insert(key.into(), value);
    }
}

/// The half-open time range `[begin, end]` a window collection covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRange {
    pub begin: i64,
    pub end: i64,
}

impl WindowRange {
    pub fn new(begin: i64, end: i64) -> Self {
        Self { begin, end }
    }
}

/// An ordered sequence of tuples emitted by a window, with its range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    pub content: Vec<SharedTuple>,
    pub range: Option<WindowRange>,
}

impl Collection {
    pub fn new(content: Vec<SharedTuple>, range: WindowRange) -> Self {
        Self {
            content,
            range: Some(range),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            content: Vec::with_capacity(cap),
            range: None,
        }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn add(&mut self, t: SharedTuple) {
        self.content.push(t);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedTuple> {
        self.content.iter()
    }
}

/// Tuples sharing one dimension key within a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedTuples {
    pub key: String,
    pub content: Vec<SharedTuple>,
    pub range: Option<WindowRange>,
}

/// All groups produced from one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedTuplesSet {
    pub groups: Vec<GroupedTuples>,
}

impl GroupedTuplesSet {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// One item on an inter-operator channel.
///
/// `Watermark`, `Eof` and `Error` are control items: they bypass worker
/// functions and pass through concurrent operators unchanged.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Tuple(SharedTuple),
    Collection(Collection),
    Grouped(GroupedTuplesSet),
    /// Event-time watermark in milliseconds. No tuple at or before this
    /// timestamp will arrive afterwards.
    Watermark(i64),
    Eof,
    Error(EngineError),
}

impl StreamItem {
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            StreamItem::Watermark(_) | StreamItem::Eof | StreamItem::Error(_)
        )
    }

    pub fn tuple(t: Tuple) -> Self {
        StreamItem::Tuple(Arc::new(t))
    }
}

impl From<Tuple> for StreamItem {
    fn from(t: Tuple) -> Self {
        StreamItem::Tuple(Arc::new(t))
    }
}

impl From<EngineError> for StreamItem {
    fn from(e: EngineError) -> Self {
        StreamItem::Error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_vs_decoded() {
        let raw = Tuple::raw("src", b"{}".to_vec(), IndexMap::with_hasher(FxBuildHasher), 100);
        assert!(raw.is_raw());
        assert!(!raw.is_control());

        let decoded = Tuple::decoded("src", IndexMap::with_hasher(FxBuildHasher), 100)
            .with_field("v", 1i64);
        assert!(!decoded.is_raw());
        assert_eq!(decoded.get_int("v"), Some(1));
    }

    #[test]
    fn test_control_tuple() {
        let mut meta = IndexMap::with_hasher(FxBuildHasher);
        meta.insert(Arc::from("file"), Value::Str("a.json".to_string()));
        let t = Tuple::control("file_src", meta, 5);
        assert!(t.is_control());
        assert!(!t.is_raw());
        assert_eq!(t.metadata.get("file").and_then(|v| v.as_str()), Some("a.json"));
    }

    #[test]
    fn test_field_accessors() {
        let t = Tuple::decoded("s", IndexMap::with_hasher(FxBuildHasher), 0)
            .with_field("f", 1.5f64)
            .with_field("i", 7i64)
            .with_field("s", "x");
        assert_eq!(t.get_float("f"), Some(1.5));
        assert_eq!(t.get_float("i"), Some(7.0));
        assert_eq!(t.get_int("f"), Some(1));
        assert_eq!(t.get_str("s"), Some("x"));
        assert_eq!(t.get("missing"), None);
    }

    #[test]
    fn test_collection_range() {
        let mut c = Collection::with_capacity(4);
        c.add(Arc::new(Tuple::decoded("s", IndexMap::with_hasher(FxBuildHasher), 10)));
        c.range = Some(WindowRange::new(0, 1000));
        assert_eq!(c.len(), 1);
        assert_eq!(c.range.unwrap().end, 1000);
    }

    #[test]
    fn test_control_items() {
        assert!(StreamItem::Watermark(5).is_control());
        assert!(StreamItem::Eof.is_control());
        assert!(StreamItem::Error(EngineError::decode("x")).is_control());
        assert!(!StreamItem::tuple(Tuple::decoded(
            "s",
            IndexMap::with_hasher(FxBuildHasher),
            0
        ))
        .is_control());
    }
}
