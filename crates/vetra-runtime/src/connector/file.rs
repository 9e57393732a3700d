//! File source and sink: line-delimited payloads.

use crate::connection::PropMap;
use crate::error::{EngineError, Result};
use crate::node::sink::Sink;
use crate::node::source::{Ingest, IngestPayload, Source};
use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::info;
use vetra_core::Value;

/// Reads a file line by line, each line one raw payload. A boundary control
/// tuple marks the end of the file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
        }
    }
}

impl Default for FileSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for FileSource {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        let Some(path) = props.get("path").and_then(|v| v.as_str()) else {
            return Err(EngineError::Plan("file source requires a path".to_string()));
        };
        if path.is_empty() {
            return Err(EngineError::Plan("file source path cannot be empty".to_string()));
        }
        self.path = PathBuf::from(path);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Err(EngineError::io(format!(
                "file {} does not exist",
                self.path.display()
            )));
        }
        Ok(())
    }

    async fn subscribe(&mut self, ingest: Ingest) -> Result<()> {
        let path = self.path.clone();
        let file = File::open(&path)
            .await
            .map_err(|e| EngineError::io(format!("open {}: {}", path.display(), e)))?;
        tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.is_empty() {
                            continue;
                        }
                        ingest
                            .ingest(
                                IngestPayload::Bytes(line.into_bytes()),
                                IndexMap::with_hasher(FxBuildHasher),
                                None,
                            )
                            .await;
                    }
                    Ok(None) => {
                        // End of file: signal the boundary downstream.
                        let mut metadata = IndexMap::with_hasher(FxBuildHasher);
                        metadata.insert(
                            Arc::from("file"),
                            Value::Str(path.display().to_string()),
                        );
                        metadata.insert(Arc::from("eof"), Value::Bool(true));
                        ingest
                            .ingest(IngestPayload::Boundary, metadata, None)
                            .await;
                        info!(file = %path.display(), "file source finished");
                        return;
                    }
                    Err(e) => {
                        ingest
                            .error(EngineError::io(format!(
                                "read {}: {}",
                                path.display(),
                                e
                            )))
                            .await;
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Appends each payload as one line.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            writer: None,
        }
    }
}

impl Default for FileSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for FileSink {
    fn provision(&mut self, props: &PropMap) -> Result<()> {
        let Some(path) = props.get("path").and_then(|v| v.as_str()) else {
            return Err(EngineError::Plan("file sink requires a path".to_string()));
        };
        self.path = PathBuf::from(path);
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EngineError::io(format!("open {}: {}", self.path.display(), e)))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    async fn collect(&mut self, payload: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| EngineError::io("file sink is not connected"))?;
        writer
            .write_all(payload)
            .await
            .map_err(|e| EngineError::io(format!("write: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| EngineError::io(format!("write: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| EngineError::io(format!("flush: {}", e)))?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush().await;
        }
    }
}
