//! Built-in source and sink connectors.
//!
//! # Architecture
//!
//! ```text
//! External System ─────> Source ─────> topology ─────> Sink ─────> External System
//!   (MQTT broker)       (MqttSource)                 (HttpSink)     (Webhook)
//! ```
//!
//! Connector wire protocols live behind the `Source`/`Sink` contracts; the
//! engine core only sees bytes plus metadata. Factories are registered by
//! lowercase type name and instantiated per rule.

mod console;
mod file;
mod http;
mod memory;
#[cfg(feature = "mqtt")]
mod mqtt;

pub use console::ConsoleSink;
pub use file::{FileSink, FileSource};
pub use http::HttpSink;
pub use memory::{MemoryBroker, MemorySink, MemorySource};
#[cfg(feature = "mqtt")]
pub use mqtt::{mqtt_connection_factory, MqttSink, MqttSource};

use crate::error::{EngineError, Result};
use crate::node::sink::Sink;
use crate::node::source::Source;
use std::collections::HashMap;
use std::sync::Arc;

pub type SourceFactory = Arc<dyn Fn() -> Box<dyn Source> + Send + Sync>;
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn Sink> + Send + Sync>;

/// Registry of connector factories, keyed by lowercase type name.
pub struct ConnectorRegistry {
    sources: HashMap<String, SourceFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
            sinks: HashMap::new(),
        }
    }

    /// A registry with the built-in connectors. The memory connectors share
    /// the given broker.
    pub fn with_builtins(broker: Arc<MemoryBroker>) -> Self {
        let mut registry = Self::new();
        let b = broker.clone();
        registry.register_source("memory", Arc::new(move || MemorySource::boxed(b.clone())));
        let b = broker;
        registry.register_sink("memory", Arc::new(move || MemorySink::boxed(b.clone())));
        registry.register_source("file", Arc::new(|| Box::new(FileSource::new())));
        registry.register_sink("file", Arc::new(|| Box::new(FileSink::new())));
        registry.register_sink("console", Arc::new(|| Box::new(ConsoleSink::new())));
        registry.register_sink("http", Arc::new(|| Box::new(HttpSink::new())));
        #[cfg(feature = "mqtt")]
        {
            registry.register_source("mqtt", Arc::new(|| Box::new(MqttSource::new())));
            registry.register_sink("mqtt", Arc::new(|| Box::new(MqttSink::new())));
        }
        registry
    }

    pub fn register_source(&mut self, typ: &str, factory: SourceFactory) {
        self.sources.insert(typ.to_lowercase(), factory);
    }

    pub fn register_sink(&mut self, typ: &str, factory: SinkFactory) {
        self.sinks.insert(typ.to_lowercase(), factory);
    }

    pub fn create_source(&self, typ: &str) -> Result<Box<dyn Source>> {
        self.sources
            .get(&typ.to_lowercase())
            .map(|f| f())
            .ok_or_else(|| EngineError::Plan(format!("unknown source type: {}", typ)))
    }

    pub fn create_sink(&self, typ: &str) -> Result<Box<dyn Sink>> {
        self.sinks
            .get(&typ.to_lowercase())
            .map(|f| f())
            .ok_or_else(|| EngineError::Plan(format!("unknown sink type: {}", typ)))
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = ConnectorRegistry::with_builtins(Arc::new(MemoryBroker::new()));
        assert!(registry.create_source("memory").is_ok());
        assert!(registry.create_source("MEMORY").is_ok());
        assert!(registry.create_sink("console").is_ok());
        assert!(registry.create_sink("http").is_ok());
        assert!(registry.create_source("nope").is_err());
        assert!(matches!(
            registry.create_sink("nope").unwrap_err(),
            EngineError::Plan(_)
        ));
    }
}
