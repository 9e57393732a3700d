//! Per-node statistics and Prometheus export.

use prometheus::{GaugeVec, Opts, Registry};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime counters kept by every node. Cheap atomics, read by the
/// management layer and mirrored into Prometheus when export is enabled.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub records_in: AtomicU64,
    pub records_out: AtomicU64,
    pub exceptions: AtomicU64,
    pub messages_processed: AtomicU64,
    pub buffer_length: AtomicI64,
}

impl NodeStats {
    pub fn inc_records_in(&self) {
        self.records_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_records_out(&self) {
        self.records_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_exceptions(&self) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_buffer_length(&self, len: i64) {
        self.buffer_length.store(len, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_out: self.records_out.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            buffer_length: self.buffer_length.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records_in: u64,
    pub records_out: u64,
    pub exceptions: u64,
    pub messages_processed: u64,
    pub buffer_length: i64,
}

/// Prometheus metrics for the engine, labelled by rule and operator.
///
/// Node counters are mirrored as gauges set from the atomic snapshots, so
/// series can be dropped cleanly when a rule is removed.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub records_in: GaugeVec,
    pub records_out: GaugeVec,
    pub exceptions: GaugeVec,
    pub buffer_length: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let records_in = GaugeVec::new(
            Opts::new("vetra_records_in", "Records received by operator"),
            &["rule", "op"],
        )
        .expect("failed to create records_in gauge");

        let records_out = GaugeVec::new(
            Opts::new("vetra_records_out", "Records emitted by operator"),
            &["rule", "op"],
        )
        .expect("failed to create records_out gauge");

        let exceptions = GaugeVec::new(
            Opts::new("vetra_exceptions", "Exceptions counted by operator"),
            &["rule", "op"],
        )
        .expect("failed to create exceptions gauge");

        let buffer_length = GaugeVec::new(
            Opts::new("vetra_buffer_length", "Input buffer length by operator"),
            &["rule", "op"],
        )
        .expect("failed to create buffer_length gauge");

        registry
            .register(Box::new(records_in.clone()))
            .expect("failed to register records_in");
        registry
            .register(Box::new(records_out.clone()))
            .expect("failed to register records_out");
        registry
            .register(Box::new(exceptions.clone()))
            .expect("failed to register exceptions");
        registry
            .register(Box::new(buffer_length.clone()))
            .expect("failed to register buffer_length");

        Self {
            registry: Arc::new(registry),
            records_in,
            records_out,
            exceptions,
            buffer_length,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Push a node's counters into the labelled series.
    pub fn record(&self, rule: &str, op: &str, snap: StatsSnapshot) {
        let labels = &[rule, op];
        self.records_in
            .with_label_values(labels)
            .set(snap.records_in as f64);
        self.records_out
            .with_label_values(labels)
            .set(snap.records_out as f64);
        self.exceptions
            .with_label_values(labels)
            .set(snap.exceptions as f64);
        self.buffer_length
            .with_label_values(labels)
            .set(snap.buffer_length as f64);
    }

    /// Drop all series belonging to one operator of a rule.
    pub fn remove(&self, rule: &str, op: &str) {
        let labels = &[rule, op];
        let _ = self.records_in.remove_label_values(labels);
        let _ = self.records_out.remove_label_values(labels);
        let _ = self.exceptions.remove_label_values(labels);
        let _ = self.buffer_length.remove_label_values(labels);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_stats_counters() {
        let stats = NodeStats::default();
        stats.inc_records_in();
        stats.inc_records_in();
        stats.inc_records_out();
        stats.inc_exceptions();
        stats.set_buffer_length(7);

        let snap = stats.snapshot();
        assert_eq!(snap.records_in, 2);
        assert_eq!(snap.records_out, 1);
        assert_eq!(snap.exceptions, 1);
        assert_eq!(snap.buffer_length, 7);
    }

    #[test]
    fn test_metrics_record_and_remove() {
        let metrics = Metrics::new();
        let stats = NodeStats::default();
        stats.inc_records_in();
        metrics.record("rule1", "source", stats.snapshot());

        let families = metrics.registry().gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "vetra_records_in")
            .expect("records_in family registered");
        assert_eq!(family.get_metric().len(), 1);
        assert_eq!(family.get_metric()[0].get_gauge().get_value(), 1.0);

        metrics.remove("rule1", "source");
        let families = metrics.registry().gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "vetra_records_in");
        if let Some(f) = family {
            assert!(f.get_metric().is_empty());
        }
    }
}
