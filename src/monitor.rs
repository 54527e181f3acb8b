//! Flow evaluation and the periodic control loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::classifier::{condense, Classifier};
use crate::config::MonitorConfig;
use crate::decision::{bdp_bytes, decide, reaction, Policy};
use crate::error::EvalError;
use crate::features::{
    sort_by_arrival, window_throughput_bps, FeatureExtractor, MIN_RTT_UNKNOWN,
};
use crate::flow::{FlowRecord, FlowTable};
use crate::mitigation::Actuator;
use crate::reaction::{ReactionStrategy, Schedule};
use crate::worker::{Submit, WorkSubmitter};
use crate::{Decision, FlowKey, Label, PacketSample};

/// The classifier together with the extractor built for its input schema.
pub struct Inference {
    classifier: Box<dyn Classifier>,
    extractor: FeatureExtractor,
}

impl Inference {
    pub fn new(classifier: Box<dyn Classifier>, window: usize) -> Result<Self> {
        let extractor = FeatureExtractor::new(classifier.input_schema(), window)?;
        Ok(Self {
            classifier,
            extractor,
        })
    }

    /// Featurize, sanitize, and classify `samples`, condensing to one label.
    pub fn classify(
        &self,
        flow: &FlowKey,
        samples: &[PacketSample],
        min_rtt_us: &mut u32,
    ) -> Result<Label, EvalError> {
        let (mut window, min_rtt) = self.extractor.extract(flow, samples, *min_rtt_us);
        *min_rtt_us = min_rtt;
        window.sanitize(self.classifier.accepts_missing());

        let classify_err = |source| EvalError::Classify {
            flow: *flow,
            source,
        };
        let labels = self.classifier.predict(&window).map_err(classify_err)?;
        condense(&labels).map_err(classify_err)
    }
}

/// Mitigation-relevant state of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalState {
    pub min_rtt_us: u32,
    pub label: Label,
    pub decision: Decision,
}

impl Default for EvalState {
    fn default() -> Self {
        Self {
            min_rtt_us: MIN_RTT_UNKNOWN,
            label: Label::default(),
            decision: Decision::default(),
        }
    }
}

impl From<&FlowRecord> for EvalState {
    fn from(record: &FlowRecord) -> Self {
        Self {
            min_rtt_us: record.min_rtt_us,
            label: record.label,
            decision: record.decision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub label: Option<Label>,
    pub decision: Decision,
    /// Whether the shared table was written.
    pub changed: bool,
}

enum Mode {
    Classify {
        inference: Inference,
        strategy: ReactionStrategy,
    },
    Schedule(Schedule),
}

/// Runs featurization, classification, and the decision engine for a flow,
/// and pushes changed decisions to the actuator.
pub struct Evaluator {
    mode: Mode,
    actuator: Actuator,
}

impl Evaluator {
    /// A schedule policy ignores `inference`; a reaction policy requires it.
    pub fn new(policy: Policy, inference: Option<Inference>, actuator: Actuator) -> Result<Self> {
        let mode = match (policy, inference) {
            (Policy::React(strategy), Some(inference)) => Mode::Classify {
                inference,
                strategy,
            },
            (Policy::React(strategy), None) => {
                anyhow::bail!("Reaction strategy '{}' requires a classifier", strategy)
            }
            (Policy::Schedule(schedule), inference) => {
                if inference.is_some() {
                    info!("Schedule mode: classifier output will not be used");
                }
                Mode::Schedule(schedule)
            }
        };
        Ok(Self { mode, actuator })
    }

    pub fn actuator(&self) -> &Actuator {
        &self.actuator
    }

    /// Evaluate one batch of a flow's packets and update `state` in place.
    ///
    /// `state` keeps any progress made before a failure (e.g. a lower
    /// minimum RTT) so callers can store it back either way.
    pub fn evaluate(
        &mut self,
        flow: &FlowKey,
        samples: &[PacketSample],
        state: &mut EvalState,
    ) -> Result<Outcome, EvalError> {
        let (label, next) = match &mut self.mode {
            Mode::Schedule(schedule) => {
                let next = schedule
                    .lookup(Instant::now())
                    .map_or(Decision::NotPaced, Decision::Paced);
                (None, next)
            }
            Mode::Classify {
                inference,
                strategy,
            } => {
                let sorted = sort_by_arrival(samples);
                let label = inference.classify(flow, &sorted, &mut state.min_rtt_us)?;
                state.label = label;

                let bdp = if reaction(label, state.decision).needs_bdp() {
                    bdp_estimate(flow, &sorted, state.min_rtt_us)?
                } else {
                    0.0
                };
                let next = decide(label, state.decision, bdp, *strategy).map_err(|source| {
                    EvalError::Decision {
                        flow: *flow,
                        source,
                    }
                })?;
                (Some(label), next)
            }
        };

        let changed = next != state.decision;
        if changed {
            self.actuator
                .apply(flow, next)
                .map_err(|cause| EvalError::Actuator { flow: *flow, cause })?;
        }
        state.decision = next;
        Ok(Outcome {
            label,
            decision: next,
            changed,
        })
    }
}

fn bdp_estimate(
    flow: &FlowKey,
    sorted: &[PacketSample],
    min_rtt_us: u32,
) -> Result<f64, EvalError> {
    let tput_bps = window_throughput_bps(sorted).ok_or(EvalError::UndefinedBdp {
        flow: *flow,
        reason: "throughput needs two packets spanning a nonzero time",
    })?;
    bdp_bytes(tput_bps, min_rtt_us).ok_or(EvalError::UndefinedBdp {
        flow: *flow,
        reason: "minimum RTT unknown",
    })
}

/// Where due flows are sent.
pub enum Dispatch {
    /// Evaluate on the control-loop thread.
    Inline(Evaluator),
    /// Hand batches to an inference worker.
    Pipeline(WorkSubmitter),
    /// Collect packets only.
    Disabled,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub flows: usize,
    pub checked: usize,
    pub busy: usize,
    pub removed: usize,
    pub changed: usize,
}

/// Periodically scans the flow table, evaluates full flows, and collects idle ones.
pub struct Monitor {
    table: Arc<FlowTable>,
    actuator: Actuator,
    dispatch: Dispatch,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        table: Arc<FlowTable>,
        actuator: Actuator,
        dispatch: Dispatch,
        config: MonitorConfig,
    ) -> Self {
        let dispatch = if config.disable_inference {
            Dispatch::Disabled
        } else {
            dispatch
        };
        Self {
            table,
            actuator,
            dispatch,
            config,
        }
    }

    /// Run until `done` is set. A fatal evaluation error ends the loop.
    pub fn run(&mut self, done: &AtomicBool) -> Result<()> {
        info!("Control loop started, interval {:?}", self.config.interval);
        while !done.load(Ordering::Relaxed) {
            self.run_cycle(Instant::now())?;
            self.report();
            thread::sleep(self.config.interval);
        }
        info!("Control loop stopped");
        Ok(())
    }

    /// One pass over the table: pick due flows, collect idle ones, evaluate.
    pub fn run_cycle(&mut self, now: Instant) -> Result<CycleStats> {
        debug!("Examining flows...");
        let mut stats = CycleStats::default();
        let Some(handles) = self.table.try_handles() else {
            debug!("Flow table busy, skipping this cycle");
            return Ok(stats);
        };
        stats.flows = handles.len();

        let mut to_check = Vec::new();
        for (key, handle) in handles {
            match handle.try_lock() {
                Some(record) => {
                    if record.num_packets() >= self.config.limit {
                        to_check.push((key, handle.clone()));
                    }
                }
                None => {
                    debug!("Could not acquire lock for flow {}", key);
                    stats.busy += 1;
                }
            }
        }

        // Without inference nothing drains the buffers, so packet count
        // cannot keep a flow alive.
        let retain = match self.dispatch {
            Dispatch::Disabled => usize::MAX,
            _ => self.config.limit,
        };
        let removed = self
            .table
            .gc(now, self.config.idle_threshold, retain, self.actuator.table());
        stats.removed = removed.len();
        if let Dispatch::Pipeline(submitter) = &mut self.dispatch {
            for key in removed {
                submitter.evict(key);
            }
            submitter.flush_evictions();
        }

        debug!("Checking {} flows...", to_check.len());
        for (key, handle) in to_check {
            let Some(mut record) = handle.try_lock() else {
                debug!("Could not acquire lock for flow {}", key);
                stats.busy += 1;
                continue;
            };
            match &mut self.dispatch {
                Dispatch::Inline(evaluator) => {
                    stats.checked += 1;
                    if check_flow(evaluator, &key, &mut record, now)? {
                        stats.changed += 1;
                    }
                }
                Dispatch::Pipeline(submitter) => {
                    if submitter.is_in_flight(&key) {
                        debug!("Flow {} already has a batch in flight", key);
                        continue;
                    }
                    if submitter.has_pending_eviction(&key) {
                        debug!("Flow {} is still being evicted", key);
                        continue;
                    }
                    record.latest_seen_time = Some(now);
                    let batch = record.take_packets();
                    match submitter.submit(key, batch) {
                        Submit::Queued => stats.checked += 1,
                        Submit::InFlight => {}
                        Submit::QueueFull => {
                            warn!("Inference queue full, dropped batch for flow {}", key)
                        }
                        Submit::Disconnected => anyhow::bail!("Inference worker is gone"),
                    }
                }
                Dispatch::Disabled => {}
            }
        }

        if let Dispatch::Pipeline(submitter) = &self.dispatch {
            submitter.heartbeat();
        }
        Ok(stats)
    }

    fn report(&self) {
        let lines = self.report_lines();
        debug!("Current flows ({}):\n{}", lines.len(), lines.join("\n"));
    }

    /// One line per tracked flow with its latest label and decision.
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.table.for_each_snapshot(|key, snapshot| {
            let Some(s) = snapshot else {
                lines.push(format!("\t{}: busy", key));
                return;
            };
            let line = match &self.dispatch {
                Dispatch::Inline(_) => {
                    format!("\t{}: {} packets, {}, {}", key, s.num_packets, s.label, s.decision)
                }
                Dispatch::Pipeline(submitter) => match submitter.state(key) {
                    Some(state) => format!(
                        "\t{}: {} packets, {}, {}",
                        key, s.num_packets, state.label, state.decision
                    ),
                    None => format!("\t{}: {} packets, not evaluated", key, s.num_packets),
                },
                Dispatch::Disabled => format!("\t{}: {} packets", key, s.num_packets),
            };
            lines.push(line);
        });
        lines
    }
}

/// Evaluate a locked flow and store the results back into its record.
///
/// Returns whether the decision changed. Recoverable failures are logged
/// and skipped; fatal ones are returned.
fn check_flow(
    evaluator: &mut Evaluator,
    key: &FlowKey,
    record: &mut FlowRecord,
    now: Instant,
) -> Result<bool, EvalError> {
    debug!("Checking flow {}", key);
    record.latest_seen_time = Some(now);
    let samples = record.take_packets();
    let mut state = EvalState::from(&*record);

    let start = Instant::now();
    let result = evaluator.evaluate(key, &samples, &mut state);
    debug!("Inference took: {:.2} ms", start.elapsed().as_secs_f64() * 1e3);

    record.min_rtt_us = state.min_rtt_us;
    record.label = state.label;
    record.decision = state.decision;

    match result {
        Ok(outcome) => {
            debug!("Report for flow {}: {}, {}", key, state.label, outcome.decision);
            Ok(outcome.changed)
        }
        Err(e) if e.is_recoverable() => {
            warn!("Skipping flow {} this cycle: {}", key, e);
            Ok(false)
        }
        Err(e) => {
            error!("Inference failed due to an unexpected error: {}", e);
            Err(e)
        }
    }
}
