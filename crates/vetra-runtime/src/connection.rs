//! Named, refcounted, process-wide connection pool.
//!
//! Sources and sinks share external connections (an MQTT client, an HTTP
//! endpoint) by name. A connection is created once through its registered
//! factory, attached by each user, and may only be dropped when its refcount
//! has returned to zero. Persisted connections are re-materialized from the
//! KV store at init.

use crate::error::{EngineError, Result};
use crate::persistence::KvStore;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use vetra_core::Value;

/// Properties for a connection, as supplied by the management surface.
pub type PropMap = IndexMap<String, Value>;

/// A live handle to an external endpoint.
///
/// Refcounting is handle-local: the pool never touches the count, it only
/// refuses to drop a connection whose count is above zero.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn close(&self);

    /// A subscriber or publisher starts using this connection.
    fn attach(&self);

    /// A subscriber stops using this connection.
    fn detach_sub(&self);

    /// A publisher stops using this connection.
    fn detach_pub(&self);

    fn ref_count(&self) -> usize;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

type FactoryFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>>> + Send>>;

/// Factory signature: `(id, props) -> handle`.
pub type ConnectionFactory = Arc<dyn Fn(String, PropMap) -> FactoryFuture + Send + Sync>;

struct ConnectionMeta {
    typ: String,
    props: PropMap,
    persisted: bool,
    conn: Arc<dyn Connection>,
}

/// Backoff bounds for factory retries.
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(180);

/// Run `op` under exponential backoff. Retries only I/O-classified errors;
/// any other error is surfaced immediately as permanent.
pub async fn retry_io<T, F, Fut>(max_elapsed: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut delay = BACKOFF_INITIAL;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_io_error() => {
                if start.elapsed() + delay > max_elapsed {
                    return Err(e);
                }
                debug!(delay_ms = delay.as_millis() as u64, "retrying after io error: {}", e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BACKOFF_MAX);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Process-wide pool of named connections.
pub struct ConnectionPool {
    factories: RwLock<HashMap<String, ConnectionFactory>>,
    pool: RwLock<HashMap<String, ConnectionMeta>>,
    kv: Arc<dyn KvStore>,
}

impl ConnectionPool {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            pool: RwLock::new(HashMap::new()),
            kv,
        }
    }

    /// Register a factory under a lowercase type name.
    pub async fn register_factory(&self, typ: &str, factory: ConnectionFactory) {
        self.factories
            .write()
            .await
            .insert(typ.to_lowercase(), factory);
    }

    /// Re-materialize all persisted connections. Any one failing connection
    /// aborts initialization with a wrapped error.
    pub async fn init(&self) -> Result<()> {
        let entries = self.kv.scan_prefix("connections.")?;
        for (key, props) in entries {
            let mut parts = key.splitn(3, '.');
            let (Some(_), Some(typ), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let props: PropMap = serde_json::from_value(props)
                .map_err(|e| EngineError::Store(format!("connection {} props: {}", id, e)))?;
            let conn = self.invoke_factory(typ, id, props.clone()).await.map_err(|e| {
                EngineError::Rule(format!("initialize connection {} failed: {}", id, e))
            })?;
            self.pool.write().await.insert(
                id.to_string(),
                ConnectionMeta {
                    typ: typ.to_string(),
                    props,
                    persisted: true,
                    conn,
                },
            );
            info!(id, typ, "re-materialized persisted connection");
        }
        Ok(())
    }

    async fn invoke_factory(
        &self,
        typ: &str,
        id: &str,
        props: PropMap,
    ) -> Result<Arc<dyn Connection>> {
        let factory = {
            let factories = self.factories.read().await;
            factories
                .get(&typ.to_lowercase())
                .cloned()
                .ok_or_else(|| EngineError::Plan(format!("unknown connection type {}", typ)))?
        };
        let id = id.to_string();
        retry_io(BACKOFF_MAX_ELAPSED, || factory(id.clone(), props.clone())).await
    }

    /// Create a named connection. Fails if the id already exists. When
    /// `persist` is set the connection definition is written to the KV store
    /// under the `connections` namespace.
    pub async fn create(
        &self,
        id: &str,
        typ: &str,
        props: PropMap,
        persist: bool,
    ) -> Result<Arc<dyn Connection>> {
        if id.is_empty() || typ.is_empty() {
            return Err(EngineError::Rule(
                "connection id and type should be defined".to_string(),
            ));
        }
        let mut pool = self.pool.write().await;
        if pool.contains_key(id) {
            return Err(EngineError::Rule(format!(
                "connection {} already been created",
                id
            )));
        }
        let conn = self.invoke_factory(typ, id, props.clone()).await?;
        if persist {
            let value = serde_json::to_value(&props)
                .map_err(|e| EngineError::Store(format!("serialize props: {}", e)))?;
            self.kv
                .put(&format!("connections.{}.{}", typ, id), &value)?;
        }
        pool.insert(
            id.to_string(),
            ConnectionMeta {
                typ: typ.to_string(),
                props,
                persisted: persist,
                conn: conn.clone(),
            },
        );
        Ok(conn)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<dyn Connection>> {
        if id.is_empty() {
            return Err(EngineError::Rule(
                "connection id should be defined".to_string(),
            ));
        }
        let pool = self.pool.read().await;
        pool.get(id)
            .map(|m| m.conn.clone())
            .ok_or_else(|| EngineError::not_found("connection", id))
    }

    /// Drop a named connection. Refused while the refcount is above zero.
    pub async fn drop_connection(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(EngineError::Rule(
                "connection id should be defined".to_string(),
            ));
        }
        let mut pool = self.pool.write().await;
        let Some(meta) = pool.get(id) else {
            return Ok(());
        };
        if meta.conn.ref_count() > 0 {
            return Err(EngineError::Rule(format!(
                "connection {} can't be dropped due to reference",
                id
            )));
        }
        if meta.persisted {
            self.kv
                .delete(&format!("connections.{}.{}", meta.typ, id))?;
        }
        let meta = pool.remove(id).expect("checked above");
        meta.conn.close().await;
        Ok(())
    }

    pub async fn ping(&self, id: &str) -> Result<()> {
        let conn = self.get(id).await?;
        conn.ping().await
    }

    pub async fn ids(&self) -> Vec<String> {
        self.pool.read().await.keys().cloned().collect()
    }

    pub async fn props(&self, id: &str) -> Option<PropMap> {
        self.pool.read().await.get(id).map(|m| m.props.clone())
    }
}

pub mod memory {
    //! In-memory connection for tests and embedding.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MemoryConnection {
        refs: AtomicUsize,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}

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

    pub fn factory() -> ConnectionFactory {
        Arc::new(|_id, _props| {
            Box::pin(async {
                let conn: Arc<dyn Connection> = Arc::new(MemoryConnection::default());
                Ok(conn)
            })
        })
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").finish_non_exhaustive()
    }
}
