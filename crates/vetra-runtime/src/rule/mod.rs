//! Rule lifecycle: per-rule state machines and the rule registry.
//!
//! Each rule runs two loops: an action loop accepting start/stop commands,
//! and a topology runner that drains the topology's error channel and
//! applies the restart strategy. Both loops consult the shared inner state
//! under one lock.

pub mod schedule;

use crate::error::{EngineError, Result};
use crate::node::source::now_ms;
use crate::topology::{Planner, PrintableTopo, TopoState, Topology};
use chrono::Utc;
use rand::Rng;
use schedule::{BackgroundCron, CronEntryId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vetra_core::Rule;

pub const RULE_STARTED: &str = "Running";
pub const RULE_STOPPED: &str = "Stopped: canceled manually.";
pub const RULE_TERMINATED: &str = "Stopped: schedule terminated.";
pub const RULE_WAIT: &str = "Stopped: waiting for next schedule.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSignal {
    Start,
    Stop,
}

/// `triggered` encoding: -1 deleted, 0 stopped, 1 running, 2 schedule-paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triggered {
    Deleted,
    Stopped,
    Running,
    SchedulePaused,
}

#[derive(Default)]
struct CronState {
    entry: Option<CronEntryId>,
    is_in_schedule: bool,
    start_failed_count: u32,
    cancel: Option<CancellationToken>,
    cron: String,
    duration: String,
}

struct Inner {
    rule: Rule,
    topology: Option<Topology>,
    triggered: Triggered,
    topo_graph: Option<PrintableTopo>,
    cron_state: CronState,
    last_start_ms: i64,
    last_stop_ms: i64,
    is_closed: bool,
    action_tx: Option<mpsc::UnboundedSender<ActionSignal>>,
}

pub struct RuleState {
    pub rule_id: String,
    planner: Arc<dyn Planner>,
    cron: Arc<BackgroundCron>,
    inner: Mutex<Inner>,
    // Cron jobs and auto-stop timers need an owning handle back to this
    // state.
    weak: Weak<RuleState>,
}

impl RuleState {
    /// Create the rule state: plan the topology and start the action loop.
    /// A planning failure is returned immediately; nothing is registered.
    pub fn new(
        rule: Rule,
        planner: Arc<dyn Planner>,
        cron: Arc<BackgroundCron>,
    ) -> Result<Arc<Self>> {
        let topology = planner.plan(&rule)?;
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let rs = Arc::new_cyclic(|weak| Self {
            rule_id: rule.id.clone(),
            planner,
            cron,
            inner: Mutex::new(Inner {
                rule,
                topology: Some(topology),
                triggered: Triggered::Stopped,
                topo_graph: None,
                cron_state: CronState::default(),
                last_start_ms: 0,
                last_stop_ms: 0,
                is_closed: false,
                action_tx: Some(action_tx),
            }),
            weak: weak.clone(),
        });
        rs.clone().run(action_rx);
        Ok(rs)
    }

    /// The action loop: exactly one topology runner at a time. Closing the
    /// channel terminates the rule permanently.
    fn run(self: Arc<Self>, mut action_rx: mpsc::UnboundedReceiver<ActionSignal>) {
        tokio::spawn(async move {
            info!(rule = %self.rule_id, "start rule state");
            let mut run_token: Option<CancellationToken> = None;
            loop {
                let Some(signal) = action_rx.recv().await else {
                    info!(rule = %self.rule_id, "stop rule state");
                    if let Some(token) = run_token.take() {
                        token.cancel();
                    }
                    return;
                };
                match signal {
                    ActionSignal::Start => {
                        if run_token.is_some() {
                            warn!(rule = %self.rule_id, "rule is already started");
                        } else {
                            let token = CancellationToken::new();
                            run_token = Some(token.clone());
                            tokio::spawn(self.clone().run_topo(token));
                        }
                    }
                    ActionSignal::Stop => {
                        if let Some(token) = run_token.take() {
                            token.cancel();
                        } else {
                            warn!(rule = %self.rule_id, "rule is already stopped");
                        }
                    }
                }
            }
        });
    }

    /// The topology runner: open, drain errors, restart with backoff.
    async fn run_topo(self: Arc<Self>, run_token: CancellationToken) {
        let policy = {
            let inner = self.inner.lock().unwrap();
            inner.rule.options.restart.clone()
        };
        let mut count: u32 = 0;
        let mut d = Duration::from_millis(policy.delay.max(1));

        let final_err: EngineError = loop {
            let opened = {
                let mut inner = self.inner.lock().unwrap();
                match inner.topology.as_mut() {
                    None => {
                        warn!(rule = %self.rule_id, "rule is not initialized or just stopped");
                        return;
                    }
                    Some(tp) => tp.open(),
                }
            };
            let er = match opened {
                Ok(mut err_rx) => {
                    tokio::select! {
                        e = err_rx.recv() => e,
                        _ = run_token.cancelled() => {
                            debug!(rule = %self.rule_id, "topology runner cancelled");
                            return;
                        }
                    }
                }
                Err(e) => Some(e),
            };
            let Some(er) = er else {
                // Error channel closed without an error: normal exit.
                return;
            };
            error!(rule = %self.rule_id, "closing rule for error: {}", er);
            {
                let inner = self.inner.lock().unwrap();
                if let Some(tp) = inner.topology.as_ref() {
                    tp.set_error(er.clone());
                    tp.cancel();
                }
            }

            if count < policy.attempts {
                let mut wait = d.min(Duration::from_millis(policy.max_delay.max(1)));
                if policy.jitter_factor > 0.0 {
                    wait = jitter(wait, policy.jitter_factor, policy.max_delay);
                    info!(rule = %self.rule_id, "rule will restart with jittered delay {:?}", wait);
                } else {
                    info!(rule = %self.rule_id, "rule will restart with delay {:?}", wait);
                }
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = run_token.cancelled() => {
                        debug!(rule = %self.rule_id, "stop rule retry as cancelled");
                        return;
                    }
                }
                count += 1;
                if policy.multiplier > 0.0 {
                    let next =
                        policy.delay as f64 * policy.multiplier.powi(count as i32);
                    d = Duration::from_millis(next as u64);
                }
                // The topology is fully replaced on each restart.
                let replanned = {
                    let inner = self.inner.lock().unwrap();
                    self.planner.plan(&inner.rule)
                };
                match replanned {
                    Ok(tp) => {
                        let mut inner = self.inner.lock().unwrap();
                        inner.topology = Some(tp);
                    }
                    Err(e) => break e,
                }
            } else {
                break er;
            }
        };

        // Exhausted retries: transition to stopped, keeping the graph for
        // post-mortem inspection.
        debug!(rule = %self.rule_id, "retries exhausted: {}", final_err);
        let mut inner = self.inner.lock().unwrap();
        if inner.triggered != Triggered::Deleted {
            inner.triggered = Triggered::Stopped;
            let graph = inner.topology.as_ref().map(|tp| tp.graph());
            if graph.is_some() {
                inner.topo_graph = graph;
            }
            if let Some(tx) = &inner.action_tx {
                let _ = tx.send(ActionSignal::Stop);
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.triggered == Triggered::Deleted {
            return Err(EngineError::Rule(format!(
                "rule {} is already deleted",
                self.rule_id
            )));
        }
        if inner.rule.is_long_running_schedule_rule() {
            let is_in = schedule::is_in_schedule_ranges(
                Utc::now(),
                &inner.rule.options.cron_datetime_range,
            )?;
            if !is_in {
                inner.triggered = Triggered::SchedulePaused;
                return Ok(());
            }
        }
        if inner.rule.is_schedule_rule() {
            return self.start_schedule_rule(&mut inner);
        }
        self.start_locked(&mut inner)
    }

    /// Register the cron job. On each fire the job checks the datetime
    /// ranges, starts the rule and schedules the auto-stop after `duration`.
    fn start_schedule_rule(&self, inner: &mut Inner) -> Result<()> {
        if inner.cron_state.is_in_schedule {
            return Err(EngineError::Rule(format!(
                "rule {} is already in schedule",
                self.rule_id
            )));
        }
        let cron_expr = inner.rule.options.cron.clone().unwrap_or_default();
        let duration_str = inner.rule.options.duration.clone().unwrap_or_default();
        let d = schedule::parse_duration(&duration_str)?;
        let cron_token = CancellationToken::new();
        inner.cron_state.cancel = Some(cron_token.clone());

        let now = Utc::now();
        let in_range =
            schedule::is_in_schedule_ranges(now, &inner.rule.options.cron_datetime_range)?;
        if in_range {
            let (running, remaining) = schedule::is_in_running_schedule(&cron_expr, now, d)?;
            if running {
                inner.cron_state.cron = cron_expr.clone();
                inner.cron_state.duration = duration_str.clone();
                self.start_locked(inner)?;
                self.stop_after_duration(remaining, cron_token.clone());
            }
        }

        let rs = self.arc_self()?;
        let job_token = cron_token;
        let entry = self.cron.add(
            &cron_expr,
            Arc::new(move || {
                let started = {
                    let mut inner = rs.inner.lock().unwrap();
                    let allowed = match schedule::is_in_schedule_ranges(
                        Utc::now(),
                        &inner.rule.options.cron_datetime_range,
                    ) {
                        Ok(a) => a,
                        Err(e) => {
                            inner.cron_state.start_failed_count += 1;
                            error!(rule = %rs.rule_id, "{}", e);
                            return;
                        }
                    };
                    if !allowed {
                        inner.cron_state.start_failed_count += 1;
                        return;
                    }
                    inner.cron_state.cron =
                        inner.rule.options.cron.clone().unwrap_or_default();
                    inner.cron_state.duration =
                        inner.rule.options.duration.clone().unwrap_or_default();
                    match rs.start_locked(&mut inner) {
                        Ok(()) => true,
                        Err(e) => {
                            inner.cron_state.start_failed_count += 1;
                            error!(rule = %rs.rule_id, "{}", e);
                            false
                        }
                    }
                };
                if started {
                    rs.stop_after_duration(d, job_token.clone());
                }
            }),
        )?;
        inner.cron_state.is_in_schedule = true;
        inner.cron_state.entry = Some(entry);
        Ok(())
    }

    fn arc_self(&self) -> Result<Arc<RuleState>> {
        self.weak.upgrade().ok_or_else(|| {
            EngineError::Rule(format!("rule {} is already dropped", self.rule_id))
        })
    }

    /// Auto-stop timer of a scheduled activation.
    fn stop_after_duration(&self, d: Duration, cron_token: CancellationToken) {
        let Ok(rs) = self.arc_self() else {
            return;
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(d) => {
                    if let Err(e) = rs.internal_stop() {
                        error!(rule = %rs.rule_id, "stop rule after duration failed: {}", e);
                    }
                }
                _ = cron_token.cancelled() => {}
            }
        });
    }

    /// Immediate start: re-plan when the previous topology is still open,
    /// mark running and signal the action loop.
    fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.triggered != Triggered::Running {
            if let Some(tp) = inner.topology.as_ref() {
                if tp.has_open() {
                    tp.cancel();
                    inner.topology = Some(self.planner.plan(&inner.rule)?);
                }
            }
            inner.triggered = Triggered::Running;
        }
        inner.last_start_ms = now_ms();
        if let Some(tx) = &inner.action_tx {
            let _ = tx.send(ActionSignal::Start);
        }
        Ok(())
    }

    /// User-initiated stop. Also deregisters a scheduled rule from the cron.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.stop_schedule_locked(&mut inner);
        self.stop_locked(&mut inner)
    }

    fn stop_schedule_locked(&self, inner: &mut Inner) {
        if inner.rule.is_schedule_rule() && inner.cron_state.is_in_schedule {
            inner.cron_state.is_in_schedule = false;
            if let Some(token) = inner.cron_state.cancel.take() {
                token.cancel();
            }
            inner.cron_state.start_failed_count = 0;
            if let Some(entry) = inner.cron_state.entry.take() {
                self.cron.remove(entry);
            }
        }
    }

    fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.triggered == Triggered::Deleted {
            return Err(EngineError::Rule(format!(
                "rule {} is already deleted",
                self.rule_id
            )));
        }
        inner.triggered = Triggered::Stopped;
        if let Some(tp) = inner.topology.take() {
            tp.cancel();
            // Replace so the graph stays queryable while task memory is
            // released.
            inner.topology = Some(tp.succeeded_placeholder());
        }
        inner.last_stop_ms = now_ms();
        if let Some(tx) = &inner.action_tx {
            let _ = tx.send(ActionSignal::Stop);
        }
        Ok(())
    }

    /// Auto-stop of a scheduled activation: pauses instead of stopping.
    pub fn internal_stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.rule.is_long_running_schedule_rule() && !inner.rule.is_schedule_rule() {
            let e = EngineError::Rule(format!(
                "rule {} isn't allowed to execute internal stop as it's not schedule rule",
                self.rule_id
            ));
            error!("{}", e);
            return Err(e);
        }
        if inner.triggered == Triggered::Deleted {
            return Err(EngineError::Rule(format!(
                "rule {} is already deleted",
                self.rule_id
            )));
        }
        debug!(rule = %self.rule_id, "rule internal stopped");
        inner.triggered = Triggered::SchedulePaused;
        if let Some(tp) = inner.topology.take() {
            tp.cancel();
            inner.topology = Some(tp.succeeded_placeholder());
        }
        if let Some(tx) = &inner.action_tx {
            let _ = tx.send(ActionSignal::Stop);
        }
        Ok(())
    }

    /// Update the rule and its topology, restarting when the new definition
    /// is triggered. A planning failure leaves the old topology untouched.
    pub fn update(&self, rule: Rule) -> Result<()> {
        let new_topology = self.planner.plan(&rule)?;
        {
            let mut inner = self.inner.lock().unwrap();
            self.stop_schedule_locked(&mut inner);
            self.stop_locked(&mut inner)?;
            inner.rule = rule;
            inner.topology = Some(new_topology);
        }
        let triggered = {
            let inner = self.inner.lock().unwrap();
            inner.rule.triggered
        };
        if triggered {
            self.start()?;
        }
        Ok(())
    }

    /// Tear the rule down permanently. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_closed {
            return Ok(());
        }
        if let Some(tp) = inner.topology.as_ref() {
            tp.remove_metrics();
            if inner.triggered == Triggered::Running {
                tp.cancel();
            }
        }
        inner.triggered = Triggered::Deleted;
        self.stop_schedule_locked(&mut inner);
        inner.action_tx = None; // closes the channel: the action loop exits
        inner.is_closed = true;
        Ok(())
    }

    pub fn triggered(&self) -> Triggered {
        self.inner.lock().unwrap().triggered
    }

    /// Human-readable state combining the triggered flag, the topology
    /// context and schedule awareness.
    pub fn get_state(&self) -> String {
        let inner = self.inner.lock().unwrap();
        if !inner.rule.triggered {
            return RULE_STOPPED.to_string();
        }
        let result = match &inner.topology {
            None => "Stopped: fail to create the topo.".to_string(),
            Some(tp) => match tp.state() {
                TopoState::Open | TopoState::Succeeded => RULE_STARTED.to_string(),
                TopoState::NotOpened | TopoState::Cancelled => self.stopped_state(&inner),
                TopoState::Failed(e) => format!("Stopped: {}.", e),
            },
        };
        if inner.rule.is_schedule_rule() && inner.cron_state.start_failed_count > 0 {
            return format!(
                "{} Start failed count: {}.",
                result, inner.cron_state.start_failed_count
            );
        }
        result
    }

    fn stopped_state(&self, inner: &Inner) -> String {
        if schedule::is_after_time_ranges(Utc::now(), &inner.rule.options.cron_datetime_range) {
            RULE_TERMINATED.to_string()
        } else if inner.cron_state.is_in_schedule {
            RULE_WAIT.to_string()
        } else if inner.triggered == Triggered::SchedulePaused {
            RULE_WAIT.to_string()
        } else {
            RULE_STOPPED.to_string()
        }
    }

    pub fn get_topo_graph(&self) -> Option<PrintableTopo> {
        let inner = self.inner.lock().unwrap();
        if let Some(graph) = &inner.topo_graph {
            Some(graph.clone())
        } else {
            inner.topology.as_ref().map(|tp| tp.graph())
        }
    }

    /// `(last_start, last_stop, next_schedule_start)` in epoch milliseconds.
    pub fn get_schedule_timestamps(&self) -> (i64, i64, i64) {
        let inner = self.inner.lock().unwrap();
        let mut next = 0;
        if inner.rule.is_schedule_rule() {
            if let Some(cron) = &inner.rule.options.cron {
                let in_range = schedule::is_in_schedule_ranges(
                    Utc::now(),
                    &inner.rule.options.cron_datetime_range,
                )
                .unwrap_or(false);
                if in_range {
                    next = schedule::next_schedule_time(cron, Utc::now()).unwrap_or(0);
                }
            }
        }
        (inner.last_start_ms, inner.last_stop_ms, next)
    }
}

/// Restart backoff jitter: multiply by a factor in `[1-jf, 1+jf]`, rerolling
/// while the result leaves `(0, max_delay]`.
fn jitter(d: Duration, factor: f64, max_delay_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let base = d.as_millis() as f64;
    let max = max_delay_ms.max(1) as f64;
    loop {
        let jittered = (base * ((rng.gen::<f64>() * 2.0 - 1.0) * factor + 1.0)).round();
        if jittered > 0.0 && jittered <= max {
            return Duration::from_millis(jittered as u64);
        }
    }
}

/// Registry of all rules in the process.
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<RuleState>>>,
    planner: Arc<dyn Planner>,
    cron: Arc<BackgroundCron>,
}

impl RuleRegistry {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            planner,
            cron: Arc::new(BackgroundCron::new()),
        }
    }

    /// Create and register a rule; start it when its definition is
    /// triggered. Planning failures leave the registry untouched.
    pub fn create_rule(&self, rule: Rule) -> Result<Arc<RuleState>> {
        {
            let rules = self.rules.read().unwrap();
            if rules.contains_key(&rule.id) {
                return Err(EngineError::Rule(format!(
                    "rule {} already exists",
                    rule.id
                )));
            }
        }
        let triggered = rule.triggered;
        let rs = RuleState::new(rule, self.planner.clone(), self.cron.clone())?;
        self.rules
            .write()
            .unwrap()
            .insert(rs.rule_id.clone(), rs.clone());
        if triggered {
            if let Err(e) = rs.start() {
                // The rule never became usable; do not leave it behind.
                self.rules.write().unwrap().remove(&rs.rule_id);
                let _ = rs.close();
                return Err(e);
            }
        }
        Ok(rs)
    }

    pub fn get(&self, id: &str) -> Result<Arc<RuleState>> {
        self.rules
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("rule", id))
    }

    pub fn start_rule(&self, id: &str) -> Result<()> {
        let rs = self.get(id)?;
        {
            let mut inner = rs.inner.lock().unwrap();
            inner.rule.triggered = true;
        }
        rs.start()
    }

    pub fn stop_rule(&self, id: &str) -> Result<()> {
        let rs = self.get(id)?;
        {
            let mut inner = rs.inner.lock().unwrap();
            inner.rule.triggered = false;
        }
        rs.stop()
    }

    pub fn update_rule(&self, rule: Rule) -> Result<()> {
        let rs = self.get(&rule.id)?;
        rs.update(rule)
    }

    /// Close and remove: a deleted rule never reappears in the registry.
    pub fn delete_rule(&self, id: &str) -> Result<()> {
        let rs = {
            let mut rules = self.rules.write().unwrap();
            rules
                .remove(id)
                .ok_or_else(|| EngineError::not_found("rule", id))?
        };
        rs.close()
    }

    pub fn get_state(&self, id: &str) -> Result<String> {
        Ok(self.get(id)?.get_state())
    }

    pub fn ids(&self) -> Vec<String> {
        self.rules.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PropMap;
    use crate::node::sink::{Sink, SinkConf, SinkNode};
    use crate::node::source::{Ingest, Source, SourceNode};
    use crate::transform::Transform;
    use crate::codec::{Converter, Format};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vetra_core::{RestartPolicy, RuleOptions};

    /// Source whose first `fail_times` connects are rejected; attempts are
    /// counted with their timestamps.
    struct FlakySource {
        attempts: Arc<Mutex<Vec<i64>>>,
        fail_times: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Source for FlakySource {
        fn provision(&mut self, _props: &PropMap) -> Result<()> {
            Ok(())
        }

        async fn connect(&mut self) -> Result<()> {
            self.attempts.lock().unwrap().push(now_ms());
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::io("connection refused"));
            }
            Ok(())
        }

        async fn subscribe(&mut self, _ingest: Ingest) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct NullSink;

    #[async_trait]
    impl Sink for NullSink {
        fn provision(&mut self, _props: &PropMap) -> Result<()> {
            Ok(())
        }

        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn collect(&mut self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct FlakyPlanner {
        attempts: Arc<Mutex<Vec<i64>>>,
        fail_times: Arc<AtomicUsize>,
    }

    impl Planner for FlakyPlanner {
        fn plan(&self, rule: &Rule) -> Result<Topology> {
            let mut topo = Topology::new(rule.id.clone(), rule.options.clone());
            let source = SourceNode::new(
                "src",
                Box::new(FlakySource {
                    attempts: self.attempts.clone(),
                    fail_times: self.fail_times.clone(),
                }),
                &PropMap::new(),
                &rule.options,
            )?;
            topo.add_source(Box::new(source))?;
            let conf = SinkConf::new(
                Transform::new(None, vec![], Converter::new(Format::Json, None)).unwrap(),
            );
            let sink = SinkNode::new("out", &rule.options, Box::new(NullSink), &PropMap::new(), conf)?;
            topo.add_operator(Box::new(sink))?;
            topo.connect("src", "out")?;
            Ok(topo)
        }
    }

    fn registry(fail_times: usize) -> (RuleRegistry, Arc<Mutex<Vec<i64>>>) {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let planner = Arc::new(FlakyPlanner {
            attempts: attempts.clone(),
            fail_times: Arc::new(AtomicUsize::new(fail_times)),
        });
        (RuleRegistry::new(planner), attempts)
    }

    fn rule_with_restart(id: &str, attempts: u32) -> Rule {
        let mut rule = Rule::new(id);
        rule.options = RuleOptions {
            restart: RestartPolicy {
                attempts,
                delay: 100,
                multiplier: 2.0,
                max_delay: 5000,
                jitter_factor: 0.0,
            },
            checkpoint_interval: 0,
            ..Default::default()
        };
        rule
    }

    // Spec scenario: source rejects Connect twice then succeeds; with
    // attempts=3, delay=100, multiplier=2 the connects land at ~0, 100, 300.
    #[tokio::test]
    async fn test_rule_restart_backoff() {
        let (registry, attempts) = registry(2);
        registry.create_rule(rule_with_restart("restart", 3)).unwrap();

        for _ in 0..100 {
            if attempts.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let times = attempts.lock().unwrap().clone();
        assert_eq!(times.len(), 3);
        let d1 = times[1] - times[0];
        let d2 = times[2] - times[1];
        assert!((80..=200).contains(&d1), "first retry after {} ms", d1);
        assert!((160..=350).contains(&d2), "second retry after {} ms", d2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get_state("restart").unwrap(), RULE_STARTED);
        assert_eq!(registry.get("restart").unwrap().triggered(), Triggered::Running);
    }

    // Pinned: attempts=0 never retries after the first failure.
    #[tokio::test]
    async fn test_attempts_zero_never_retries() {
        let (registry, attempts) = registry(10);
        registry.create_rule(rule_with_restart("noretry", 0)).unwrap();

        for _ in 0..100 {
            if registry.get("noretry").unwrap().triggered() == Triggered::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(attempts.lock().unwrap().len(), 1);
        assert_eq!(registry.get("noretry").unwrap().triggered(), Triggered::Stopped);
        // The graph stays available for post-mortem inspection.
        assert!(registry.get("noretry").unwrap().get_topo_graph().is_some());
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let (registry, _attempts) = registry(0);
        registry.create_rule(rule_with_restart("r1", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get_state("r1").unwrap(), RULE_STARTED);

        registry.stop_rule("r1").unwrap();
        assert_eq!(registry.get_state("r1").unwrap(), RULE_STOPPED);
        assert_eq!(registry.get("r1").unwrap().triggered(), Triggered::Stopped);

        registry.start_rule("r1").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get_state("r1").unwrap(), RULE_STARTED);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (registry, _) = registry(0);
        registry.create_rule(rule_with_restart("gone", 0)).unwrap();
        let rs = registry.get("gone").unwrap();
        registry.delete_rule("gone").unwrap();

        assert_eq!(rs.triggered(), Triggered::Deleted);
        assert!(rs.close().is_ok());
        // No action is accepted after close.
        assert!(rs.start().is_err());
        assert!(rs.stop().is_err());
        // The registry no longer knows the rule.
        assert!(registry.get("gone").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_rule_rejected() {
        let (registry, _) = registry(0);
        registry.create_rule(rule_with_restart("dup", 0)).unwrap();
        assert!(registry.create_rule(rule_with_restart("dup", 0)).is_err());
    }

    #[tokio::test]
    async fn test_update_swaps_topology() {
        let (registry, _) = registry(0);
        registry.create_rule(rule_with_restart("up", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut updated = rule_with_restart("up", 0);
        updated.options.buffer_length = 7;
        registry.update_rule(updated).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.get_state("up").unwrap(), RULE_STARTED);
    }

    #[tokio::test]
    async fn test_long_running_schedule_out_of_range_pauses() {
        let (registry, _) = registry(0);
        let mut rule = rule_with_restart("long", 0);
        rule.options.cron_datetime_range = vec![vetra_core::DatetimeRange {
            begin: "2099-01-01 00:00:00".to_string(),
            end: "2099-12-31 23:59:59".to_string(),
        }];
        registry.create_rule(rule).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.get("long").unwrap().triggered(), Triggered::SchedulePaused);
        assert_eq!(registry.get_state("long").unwrap(), RULE_WAIT);
    }

    #[tokio::test]
    async fn test_schedule_rule_registers_cron() {
        let (registry, _) = registry(0);
        let mut rule = rule_with_restart("sched", 0);
        rule.options.cron = Some("0 0 1 1 1 *".to_string()); // far away
        rule.options.duration = Some("1s".to_string());
        registry.create_rule(rule).unwrap();

        let rs = registry.get("sched").unwrap();
        {
            let inner = rs.inner.lock().unwrap();
            assert!(inner.cron_state.is_in_schedule);
            assert!(inner.cron_state.entry.is_some());
        }
        assert_eq!(rs.get_state(), RULE_WAIT);

        registry.stop_rule("sched").unwrap();
        {
            let inner = rs.inner.lock().unwrap();
            assert!(!inner.cron_state.is_in_schedule);
            assert!(inner.cron_state.entry.is_none());
        }
    }

    #[tokio::test]
    async fn test_schedule_rule_bad_duration_fails() {
        let (registry, _) = registry(0);
        let mut rule = rule_with_restart("badsched", 0);
        rule.options.cron = Some("0 * * * * *".to_string());
        rule.options.duration = Some("banana".to_string());
        assert!(registry.create_rule(rule).is_err());
    }
}
