//! Vetra Runtime - SQL-driven stream processing for IoT/edge workloads
//!
//! The runtime executes rule topologies: pluggable sources feed raw tuples
//! through decode, window and aggregation operators into pluggable sinks.
//! Rules are started, stopped, scheduled and torn down through per-rule
//! state machines; operator state is checkpointed for replay on recovery.

pub mod aggregation;
pub mod checkpoint;
pub mod codec;
pub mod connection;
pub mod connector;
pub mod context;
pub mod error;
pub mod metrics;
pub mod node;
pub mod persistence;
pub mod rule;
pub mod topology;
pub mod transform;
pub mod tuple;

pub use error::{EngineError, Result};
pub use metrics::Metrics;
pub use rule::{RuleRegistry, RuleState};
pub use topology::{Planner, Topology};
pub use tuple::{Collection, StreamItem, Tuple};
