//! Vetra Core - data model shared by the engine and its collaborators
//!
//! This crate carries the runtime value type and the JSON-facing rule
//! definitions. It stays dependency-light so external planners and
//! management layers can depend on it without pulling in the runtime.

pub mod rule;
pub mod value;

pub use rule::{Action, DatetimeRange, Qos, RestartPolicy, Rule, RuleOptions};
pub use value::Value;
