//! Key/value persistence collaborators.
//!
//! The engine core treats durable storage as an injected `KvStore`. Keys are
//! dot-separated namespaces: `connections.<type>.<id>`,
//! `checkpoints.<rule_id>.<cp_id>`, `keyed_state.<key>`.

use crate::error::{EngineError, Result};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &JsonValue) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    fn delete(&self, key: &str) -> Result<()>;

    /// All `(key, value)` pairs whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>>;

    fn flush(&self) -> Result<()>;
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryKv {
    data: RwLock<HashMap<String, JsonValue>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn put(&self, key: &str, value: &JsonValue) -> Result<()> {
        self.data
            .write()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>> {
        let guard = self.data.read().unwrap();
        let mut out: Vec<(String, JsonValue)> = guard
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Single-file JSON store. Loads the whole map at open, rewrites the file on
/// flush and on every mutation. Suited to edge-scale state volumes.
pub struct FileKv {
    path: PathBuf,
    data: RwLock<HashMap<String, JsonValue>>,
}

impl FileKv {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = std::fs::read(&path)
                .map_err(|e| EngineError::Store(format!("read {}: {}", path.display(), e)))?;
            serde_json::from_slice(&bytes)
                .map_err(|e| EngineError::Store(format!("parse {}: {}", path.display(), e)))?
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), "opened file kv store");
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn persist(&self, guard: &HashMap<String, JsonValue>) -> Result<()> {
        let bytes = serde_json::to_vec(guard)
            .map_err(|e| EngineError::Store(format!("serialize kv store: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Store(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        std::fs::write(&self.path, bytes)
            .map_err(|e| EngineError::Store(format!("write {}: {}", self.path.display(), e)))
    }
}

impl KvStore for FileKv {
    fn put(&self, key: &str, value: &JsonValue) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.insert(key.to_string(), value.clone());
        self.persist(&guard)
    }

    fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.data.write().unwrap();
        guard.remove(key);
        self.persist(&guard)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>> {
        let guard = self.data.read().unwrap();
        let mut out: Vec<(String, JsonValue)> = guard
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        let guard = self.data.read().unwrap();
        self.persist(&guard)
    }
}
