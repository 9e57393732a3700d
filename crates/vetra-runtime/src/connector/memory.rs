//! In-process pub/sub connectors for tests and rule chaining.

use crate::connection::PropMap;
use crate::error::{EngineError, Result};
use crate::node::sink::Sink;
use crate::node::source::{Ingest, IngestPayload, Source};
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;
use vetra_core::Value;

const CHANNEL_CAPACITY: usize = 1024;

/// Topic-keyed in-process broker shared by memory sources and sinks.
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        let mut topics = self.topics.lock().unwrap();
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        // No subscribers yet is fine; the payload is simply dropped.
        let _ = tx.send(payload);
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemorySource {
    broker: Arc<MemoryBroker>,
    topic: String,
    rx: Option<broadcast::Receiver<Vec<u8>>>,
}

impl MemorySource {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            topic: String::new(),
            rx: None,
        }
    }

    pub fn boxed(broker: Arc<MemoryBroker>) -> Box<dyn Source> {
        Box::new(Self::new(broker))
    }
}

#[async_trait]
impl Source for MemorySource {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        let Some(topic) = props.get("datasource").and_then(|v| v.as_str()) else {
            return Err(EngineError::Plan(
                "memory source requires a datasource".to_string(),
            ));
        };
        if topic.is_empty() {
            return Err(EngineError::Plan(
                "memory source datasource cannot be empty".to_string(),
            ));
        }
        self.topic = topic.to_string();
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.rx = Some(self.broker.subscribe(&self.topic));
        Ok(())
    }

    async fn subscribe(&mut self, ingest: Ingest) -> Result<()> {
        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| EngineError::io("memory source is not connected"))?;
        let topic = self.topic.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        let mut metadata = IndexMap::with_hasher(FxBuildHasher);
                        metadata
                            .insert(Arc::from("topic"), Value::Str(topic.clone()));
                        ingest
                            .ingest(IngestPayload::Bytes(payload), metadata, None)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        ingest
                            .error(EngineError::io(format!(
                                "memory source lagged by {} messages",
                                n
                            )))
                            .await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(topic, "memory topic closed");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.rx = None;
    }
}

pub struct MemorySink {
    broker: Arc<MemoryBroker>,
    topic: String,
}

impl MemorySink {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            topic: String::new(),
        }
    }

    pub fn boxed(broker: Arc<MemoryBroker>) -> Box<dyn Sink> {
        Box::new(Self::new(broker))
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        let Some(topic) = props.get("topic").and_then(|v| v.as_str()) else {
            return Err(EngineError::Plan("memory sink requires a topic".to_string()));
        };
        self.topic = topic.to_string();
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn collect(&mut self, payload: &[u8]) -> Result<()> {
        self.broker.publish(&self.topic, payload.to_vec());
        Ok(())
    }

    async fn close(&mut self) {}
}
