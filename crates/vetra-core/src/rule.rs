//! Rule definitions: the JSON-facing unit of work for the engine.
//!
//! A rule binds a query (SQL text or a pre-planned graph handled by an
//! external planner) to a set of sink actions and execution options. The
//! runtime never interprets the SQL here; it only carries it to the planner
//! seam.

use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Delivery guarantee for a rule's topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid qos {}, expect 0, 1 or 2", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(q: Qos) -> u8 {
        match q {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Restart policy applied by the rule runner when a topology fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPolicy {
    /// Maximum number of retries. 0 means never retry after the first failure.
    pub attempts: u32,
    /// Initial delay between retries, in milliseconds.
    pub delay: u64,
    /// Multiplier applied to the delay after each retry.
    pub multiplier: f64,
    /// Upper bound for the delay, in milliseconds.
    pub max_delay: u64,
    /// Jitter factor in [0, 1); 0 disables jitter.
    pub jitter_factor: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay: 1000,
            multiplier: 2.0,
            max_delay: 30_000,
            jitter_factor: 0.1,
        }
    }
}

/// An absolute datetime range during which a scheduled rule may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatetimeRange {
    /// Inclusive begin, `%Y-%m-%d %H:%M:%S` in UTC.
    pub begin: String,
    /// Inclusive end, `%Y-%m-%d %H:%M:%S` in UTC.
    pub end: String,
}

/// Execution options for a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleOptions {
    /// Process on event time instead of arrival time.
    pub is_event_time: bool,
    /// Tolerated out-of-orderness for event time, in milliseconds.
    pub late_tolerance: u64,
    /// Worker count for concurrency-capable operators.
    pub concurrency: usize,
    /// Capacity of the channels between operators.
    pub buffer_length: usize,
    /// Attach tuple metadata to sink payloads.
    pub send_meta_to_sink: bool,
    /// Forward decode/convert errors downstream as error items.
    pub send_error: bool,
    pub qos: Qos,
    /// Interval between checkpoints, in milliseconds. 0 disables.
    pub checkpoint_interval: u64,
    #[serde(alias = "restartStrategy")]
    pub restart: RestartPolicy,
    /// Cron expression (with seconds field) for scheduled rules.
    pub cron: Option<String>,
    /// How long each scheduled activation runs, e.g. "30s".
    pub duration: Option<String>,
    /// Absolute ranges constraining when the schedule may fire.
    pub cron_datetime_range: Vec<DatetimeRange>,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            is_event_time: false,
            late_tolerance: 1000,
            concurrency: 1,
            buffer_length: 1024,
            send_meta_to_sink: false,
            send_error: true,
            qos: Qos::AtMostOnce,
            checkpoint_interval: 300_000,
            restart: RestartPolicy::default(),
            cron: None,
            duration: None,
            cron_datetime_range: Vec::new(),
        }
    }
}

/// A sink action: sink type name mapped to its properties.
pub type Action = IndexMap<String, IndexMap<String, Value>>;

/// A user-defined rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// SQL text; interpreted by the external planner.
    #[serde(default)]
    pub sql: Option<String>,
    /// Pre-planned graph, opaque to the core.
    #[serde(default)]
    pub graph: Option<serde_json::Value>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub options: RuleOptions,
    /// Whether the rule should be running. Set by start/stop actions.
    #[serde(default = "default_triggered")]
    pub triggered: bool,
}

fn default_triggered() -> bool {
    true
}

impl Rule {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            sql: None,
            graph: None,
            actions: Vec::new(),
            options: RuleOptions::default(),
            triggered: true,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_options(mut self, options: RuleOptions) -> Self {
        self.options = options;
        self
    }

    /// A schedule rule runs in cron-activated bursts of a fixed duration.
    pub fn is_schedule_rule(&self) -> bool {
        self.options.cron.as_deref().is_some_and(|c| !c.is_empty())
            && self.options.duration.as_deref().is_some_and(|d| !d.is_empty())
    }

    /// A long-running schedule rule is active for entire datetime ranges,
    /// without cron or duration.
    pub fn is_long_running_schedule_rule(&self) -> bool {
        self.options.cron.as_deref().map_or(true, str::is_empty)
            && self.options.duration.as_deref().map_or(true, str::is_empty)
            && !self.options.cron_datetime_range.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_json_roundtrip() {
        let json = r#"{
            "id": "rule1",
            "sql": "SELECT * FROM demo",
            "actions": [{"console": {"pretty": true}}],
            "options": {
                "isEventTime": true,
                "lateTolerance": 500,
                "concurrency": 4,
                "bufferLength": 16,
                "sendError": false,
                "qos": 1,
                "checkpointInterval": 1000,
                "restartStrategy": {
                    "attempts": 3,
                    "delay": 100,
                    "multiplier": 2.0,
                    "maxDelay": 5000,
                    "jitterFactor": 0.0
                }
            }
        }"#;
        let rule: Rule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.id, "rule1");
        assert!(rule.options.is_event_time);
        assert_eq!(rule.options.late_tolerance, 500);
        assert_eq!(rule.options.concurrency, 4);
        assert_eq!(rule.options.buffer_length, 16);
        assert!(!rule.options.send_error);
        assert_eq!(rule.options.qos, Qos::AtLeastOnce);
        assert_eq!(rule.options.restart.attempts, 3);
        assert_eq!(rule.options.restart.delay, 100);
        assert!(rule.triggered);

        let back = serde_json::to_string(&rule).unwrap();
        let again: Rule = serde_json::from_str(&back).unwrap();
        assert_eq!(again.options.qos, Qos::AtLeastOnce);
    }

    #[test]
    fn test_rule_defaults() {
        let rule: Rule = serde_json::from_str(r#"{"id": "r"}"#).unwrap();
        assert_eq!(rule.options.buffer_length, 1024);
        assert_eq!(rule.options.concurrency, 1);
        assert_eq!(rule.options.qos, Qos::AtMostOnce);
        assert!(rule.options.send_error);
        assert!(!rule.is_schedule_rule());
        assert!(!rule.is_long_running_schedule_rule());
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let res: Result<Rule, _> =
            serde_json::from_str(r#"{"id": "r", "options": {"qos": 7}}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_schedule_rule_classification() {
        let mut rule = Rule::new("sched");
        rule.options.cron = Some("0 * * * * *".to_string());
        rule.options.duration = Some("30s".to_string());
        assert!(rule.is_schedule_rule());
        assert!(!rule.is_long_running_schedule_rule());

        let mut rule = Rule::new("long");
        rule.options.cron_datetime_range.push(DatetimeRange {
            begin: "2024-01-01 00:00:00".to_string(),
            end: "2024-12-31 23:59:59".to_string(),
        });
        assert!(!rule.is_schedule_rule());
        assert!(rule.is_long_running_schedule_rule());
    }

    #[test]
    fn test_attempts_zero_default() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.attempts, 0);
    }
}
