//! Console sink for debugging and demos.

use crate::connection::PropMap;
use crate::error::Result;
use crate::node::sink::Sink;
use async_trait::async_trait;

pub struct ConsoleSink {
    pretty: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self { pretty: false }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        self.pretty = props
            .get("pretty")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn collect(&mut self, payload: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(payload);
        if self.pretty {
            match serde_json::from_slice::<serde_json::Value>(payload) {
                Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_default()),
                Err(_) => println!("{}", text),
            }
        } else {
            println!("{}", text);
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_console_sink_collect() {
        let mut sink = ConsoleSink::new();
        sink.provision(&PropMap::new()).unwrap();
        assert!(sink.connect().await.is_ok());
        assert!(sink.collect(br#"{"v": 1}"#).await.is_ok());
        sink.close().await;
    }
}
