//! Engine error taxonomy.
//!
//! The kind decides the policy: I/O errors are retried with backoff at the
//! connection/source level, decode errors become error items in the stream,
//! planning and lifecycle errors are returned to the caller, and fatal
//! operator errors trigger the rule restart strategy.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Transient I/O failure (connection refused, timeout, broker
    /// unavailable). The only retryable kind.
    #[error("io error: {0}")]
    Io(String),

    /// Malformed payload or schema mismatch. Becomes an error item.
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid rule, unknown sink, bad operator configuration.
    #[error("planning error: {0}")]
    Plan(String),

    /// Rule lifecycle violation (deleted, already running, ...).
    #[error("rule error: {0}")]
    Rule(String),

    /// Invalid cron expression, bad duration, out-of-range datetime.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// KV / checkpoint store failure.
    #[error("store error: {0}")]
    Store(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Unexpected runtime type or a panic caught in a worker.
    #[error("fatal operator error: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn io(msg: impl Into<String>) -> Self {
        EngineError::Io(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        EngineError::Decode(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    /// Only I/O errors are retried by connection backoff.
    pub fn is_io_error(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }

    /// Whether a sink delivery failure should be queued for resend.
    pub fn is_retryable(&self) -> bool {
        self.is_io_error()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        assert!(EngineError::io("connection refused").is_io_error());
        assert!(!EngineError::decode("bad json").is_io_error());
        assert!(!EngineError::Fatal("panic".to_string()).is_io_error());
    }

    #[test]
    fn test_display() {
        let e = EngineError::not_found("connection", "mqtt1");
        assert_eq!(e.to_string(), "connection mqtt1 not found");
    }
}
