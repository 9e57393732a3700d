//! HTTP webhook sink.

use crate::connection::PropMap;
use crate::error::{EngineError, Result};
use crate::node::sink::Sink;
use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::debug;
use vetra_core::Value;

pub struct HttpSink {
    url: String,
    headers: IndexMap<String, String>,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new() -> Self {
        Self {
            url: String::new(),
            headers: IndexMap::new(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        let Some(url) = props.get("url").and_then(|v| v.as_str()) else {
            return Err(EngineError::Plan("http sink requires a url".to_string()));
        };
        self.url = url.to_string();
        if let Some(Value::Map(headers)) = props.get("headers") {
            for (k, v) in headers {
                if let Value::Str(s) = v {
                    self.headers.insert(k.clone(), s.clone());
                }
            }
        }
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn collect(&mut self, payload: &[u8]) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(payload.to_vec());
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::io(format!("post {}: {}", self.url, e)))?;
        let status = resp.status();
        if status.is_success() {
            debug!(url = %self.url, status = %status, "payload delivered");
            Ok(())
        } else if status.is_server_error() {
            // 5xx is transient; the resend queue retries it.
            Err(EngineError::io(format!("{} returned {}", self.url, status)))
        } else {
            Err(EngineError::decode(format!(
                "{} rejected payload with {}",
                self.url, status
            )))
        }
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(url: &str) -> PropMap {
        let mut p = PropMap::new();
        p.insert("url".to_string(), Value::Str(url.to_string()));
        p
    }

    #[test]
    fn test_provision() {
        let mut sink = HttpSink::new();
        assert!(sink.provision(&PropMap::new()).is_err());
        assert!(sink.provision(&props("http://localhost:9/hook")).is_ok());
        assert_eq!(sink.url, "http://localhost:9/hook");
    }

    #[test]
    fn test_headers_absorbed() {
        let mut sink = HttpSink::new();
        let mut p = props("http://localhost/hook");
        let mut headers = IndexMap::new();
        headers.insert(
            "Authorization".to_string(),
            Value::Str("Bearer token".to_string()),
        );
        p.insert("headers".to_string(), Value::Map(headers));
        sink.provision(&p).unwrap();
        assert_eq!(
            sink.headers.get("Authorization"),
            Some(&"Bearer token".to_string())
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_is_io_error() {
        let mut sink = HttpSink::new();
        // Port 9 (discard) is almost certainly closed.
        sink.provision(&props("http://127.0.0.1:9/hook")).unwrap();
        let err = sink.collect(b"{}").await.unwrap_err();
        assert!(err.is_io_error());
    }
}
