//! MQTT source and sink connectors using rumqttc.

use crate::connection::{Connection, ConnectionFactory, PropMap};
use crate::error::{EngineError, Result};
use crate::node::sink::Sink;
use crate::node::source::{Ingest, IngestPayload, Source};
use async_trait::async_trait;
use indexmap::IndexMap;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use rustc_hash::FxBuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vetra_core::Value;

const EVENTLOOP_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct MqttProps {
    server: String,
    port: u16,
    topic: String,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    qos: u8,
}

impl MqttProps {
    fn parse(props: &PropMap, need_topic: bool) -> Result<Self> {
        let server = props
            .get("server")
            .and_then(|v| v.as_str())
            .unwrap_or("localhost")
            .to_string();
        let topic = props
            .get("datasource")
            .or_else(|| props.get("topic"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if need_topic && topic.is_empty() {
            return Err(EngineError::Plan("mqtt connector requires a topic".to_string()));
        }
        Ok(Self {
            server,
            port: props
                .get("port")
                .and_then(|v| v.as_int())
                .map(|p| p as u16)
                .unwrap_or(1883),
            topic,
            client_id: props
                .get("clientId")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            username: props
                .get("username")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            password: props
                .get("password")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            qos: props.get("qos").and_then(|v| v.as_int()).unwrap_or(0) as u8,
        })
    }

    fn options(&self, fallback_id: &str) -> MqttOptions {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("vetra-{}-{}", fallback_id, std::process::id()));
        let mut opts = MqttOptions::new(client_id, &self.server, self.port);
        opts.set_keep_alive(Duration::from_secs(60));
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            opts.set_credentials(user, pass);
        }
        opts
    }
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub struct MqttSource {
    props: Option<MqttProps>,
    client: Option<AsyncClient>,
    eventloop: Option<rumqttc::EventLoop>,
}

impl MqttSource {
    pub fn new() -> Self {
        Self {
            props: None,
            client: None,
            eventloop: None,
        }
    }
}

impl Default for MqttSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for MqttSource {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        self.props = Some(MqttProps::parse(props, true)?);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let props = self
            .props
            .as_ref()
            .ok_or_else(|| EngineError::Plan("mqtt source is not provisioned".to_string()))?;
        let (client, eventloop) = AsyncClient::new(props.options("src"), EVENTLOOP_CAPACITY);
        client
            .subscribe(&props.topic, qos_from_u8(props.qos))
            .await
            .map_err(|e| EngineError::io(format!("mqtt subscribe: {}", e)))?;
        info!(server = %props.server, topic = %props.topic, "mqtt source connected");
        self.client = Some(client);
        self.eventloop = Some(eventloop);
        Ok(())
    }

    async fn subscribe(&mut self, ingest: Ingest) -> Result<()> {
        let mut eventloop = self
            .eventloop
            .take()
            .ok_or_else(|| EngineError::io("mqtt source is not connected"))?;
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        let mut metadata = IndexMap::with_hasher(FxBuildHasher);
                        metadata.insert(
                            Arc::from("topic"),
                            Value::Str(publish.topic.clone()),
                        );
                        ingest
                            .ingest(
                                IngestPayload::Bytes(publish.payload.to_vec()),
                                metadata,
                                None,
                            )
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt source eventloop error: {:?}", e);
                        ingest.error(EngineError::io(format!("mqtt: {}", e))).await;
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
    }
}

pub struct MqttSink {
    props: Option<MqttProps>,
    client: Option<AsyncClient>,
}

impl MqttSink {
    pub fn new() -> Self {
        Self {
            props: None,
            client: None,
        }
    }
}

impl Default for MqttSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        self.props = Some(MqttProps::parse(props, true)?);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let props = self
            .props
            .as_ref()
            .ok_or_else(|| EngineError::Plan("mqtt sink is not provisioned".to_string()))?;
        let (client, mut eventloop) = AsyncClient::new(props.options("sink"), EVENTLOOP_CAPACITY);
        // Drive the eventloop; publishes fail fast if the broker is gone.
        tokio::spawn(async move {
            loop {
                if let Err(e) = eventloop.poll().await {
                    warn!("mqtt sink eventloop error: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        info!(server = %props.server, topic = %props.topic, "mqtt sink connected");
        self.client = Some(client);
        Ok(())
    }

    async fn collect(&mut self, payload: &[u8]) -> Result<()> {
        let props = self
            .props
            .as_ref()
            .ok_or_else(|| EngineError::Plan("mqtt sink is not provisioned".to_string()))?;
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| EngineError::io("mqtt sink is not connected"))?;
        client
            .publish(
                &props.topic,
                qos_from_u8(props.qos),
                false,
                payload.to_vec(),
            )
            .await
            .map_err(|e| EngineError::io(format!("mqtt publish: {}", e)))
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
    }
}

/// A pooled MQTT connection handle: one client shared by sources and sinks
/// under a connection name.
struct MqttConnection {
    client: AsyncClient,
    refs: AtomicUsize,
}

#[async_trait]
impl Connection for MqttConnection {
    async fn ping(&self) -> Result<()> {
        // The eventloop keep-alive pings the broker; reachability shows up
        // as publish errors.
        Ok(())
    }

    async fn close(&self) {
        let _ = self.client.disconnect().await;
    }

    fn attach(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    fn detach_sub(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn detach_pub(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }
}

/// Factory for named MQTT connections, registered under type `mqtt`.
pub fn mqtt_connection_factory() -> ConnectionFactory {
    Arc::new(|id, props| {
        Box::pin(async move {
            let parsed = MqttProps::parse(&props, false)?;
            let (client, mut eventloop) = AsyncClient::new(parsed.options(&id), EVENTLOOP_CAPACITY);
            tokio::spawn(async move {
                loop {
                    if let Err(e) = eventloop.poll().await {
                        warn!(connection = %id, "mqtt eventloop error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            });
            let conn: Arc<dyn Connection> = Arc::new(MqttConnection {
                client,
                refs: AtomicUsize::new(0),
            });
            Ok(conn)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_props_parsing() {
        let mut p = PropMap::new();
        p.insert("server".to_string(), Value::Str("broker.local".to_string()));
        p.insert("datasource".to_string(), Value::Str("sensors/#".to_string()));
        p.insert("port".to_string(), Value::Int(8883));
        p.insert("qos".to_string(), Value::Int(1));
        let props = MqttProps::parse(&p, true).unwrap();
        assert_eq!(props.server, "broker.local");
        assert_eq!(props.port, 8883);
        assert_eq!(props.topic, "sensors/#");
        assert_eq!(props.qos, 1);
    }

    #[test]
    fn test_topic_required_for_connectors() {
        let p = PropMap::new();
        assert!(MqttProps::parse(&p, true).is_err());
        // Named connections can omit the topic.
        assert!(MqttProps::parse(&p, false).is_ok());
    }
}
