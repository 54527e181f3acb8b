//! Split pipeline: the control loop submits packet batches over a bounded
//! channel and a dedicated worker runs inference on them.
//!
//! A flow is "in flight" from the moment its batch is queued until the
//! worker has finished with it; the control loop submits nothing for a flow
//! while it is in flight, so at most one evaluation per flow runs at a time.
//! The worker owns per-flow mitigation state and publishes it in a shared
//! map so the control loop can report it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::{DashMap, DashSet};
use tracing::{debug, error, info, trace, warn};

use crate::error::EvalError;
use crate::monitor::{EvalState, Evaluator};
use crate::{FlowKey, PacketSample};

/// How long the worker blocks on the channel before rechecking for shutdown.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum WorkItem {
    Batch {
        flow: FlowKey,
        packets: Vec<PacketSample>,
    },
    /// The flow was garbage collected; drop its state.
    Evict(FlowKey),
    /// Liveness signal from the control loop.
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    Queued,
    /// A batch for this flow is still being processed.
    InFlight,
    QueueFull,
    Disconnected,
}

/// Build a connected submitter/worker pair around `evaluator`.
pub fn pipeline(depth: usize, evaluator: Evaluator) -> (WorkSubmitter, InferenceWorker) {
    let (tx, rx) = bounded(depth);
    let in_flight = Arc::new(DashSet::new());
    let states = Arc::new(DashMap::new());
    let submitter = WorkSubmitter {
        tx,
        in_flight: in_flight.clone(),
        states: states.clone(),
        pending_evictions: HashSet::new(),
    };
    let worker = InferenceWorker {
        rx,
        in_flight,
        evaluator,
        states,
    };
    (submitter, worker)
}

/// Producer half, owned by the control loop.
#[derive(Debug)]
pub struct WorkSubmitter {
    tx: Sender<WorkItem>,
    in_flight: Arc<DashSet<FlowKey>>,
    states: Arc<DashMap<FlowKey, EvalState>>,
    /// Evictions that did not fit in the queue yet.
    pending_evictions: HashSet<FlowKey>,
}

impl WorkSubmitter {
    pub fn is_in_flight(&self, flow: &FlowKey) -> bool {
        self.in_flight.contains(flow)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// The worker's latest state for `flow`.
    pub fn state(&self, flow: &FlowKey) -> Option<EvalState> {
        self.states.get(flow).map(|s| *s)
    }

    /// Queue a batch without blocking.
    pub fn submit(&self, flow: FlowKey, packets: Vec<PacketSample>) -> Submit {
        if !self.in_flight.insert(flow) {
            return Submit::InFlight;
        }
        match self.tx.try_send(WorkItem::Batch { flow, packets }) {
            Ok(()) => Submit::Queued,
            Err(e) => {
                self.in_flight.remove(&flow);
                match e {
                    TrySendError::Full(_) => Submit::QueueFull,
                    TrySendError::Disconnected(_) => Submit::Disconnected,
                }
            }
        }
    }

    /// Schedule removal of a collected flow's state in the worker. Delivered
    /// by the next [`flush_evictions`](Self::flush_evictions).
    pub fn evict(&mut self, flow: FlowKey) {
        self.pending_evictions.insert(flow);
    }

    pub fn has_pending_eviction(&self, flow: &FlowKey) -> bool {
        self.pending_evictions.contains(flow)
    }

    /// Send pending evictions, keeping those that do not fit for the next
    /// attempt. Returns how many are still pending.
    pub fn flush_evictions(&mut self) -> usize {
        let tx = &self.tx;
        self.pending_evictions
            .retain(|flow| match tx.try_send(WorkItem::Evict(*flow)) {
                Ok(()) => false,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
        if !self.pending_evictions.is_empty() {
            debug!(
                "Inference queue full, {} evictions deferred",
                self.pending_evictions.len()
            );
        }
        self.pending_evictions.len()
    }

    /// Signal liveness, but only into an idle queue.
    pub fn heartbeat(&self) {
        if !self.tx.is_empty() {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.tx.try_send(WorkItem::Heartbeat) {
            trace!("Inference queue full, skipped heartbeat");
        }
    }
}

/// Consumer half. Owns the per-flow mitigation state in this topology.
pub struct InferenceWorker {
    rx: Receiver<WorkItem>,
    in_flight: Arc<DashSet<FlowKey>>,
    evaluator: Evaluator,
    states: Arc<DashMap<FlowKey, EvalState>>,
}

impl InferenceWorker {
    /// Process work until `done` is set or every submitter is gone.
    pub fn run(&mut self, done: &AtomicBool) -> Result<(), EvalError> {
        info!("Inference worker started");
        while !done.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(RECV_TIMEOUT) {
                Ok(item) => self.handle(item)?,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Work channel closed");
                    break;
                }
            }
        }
        info!("Inference worker stopped");
        Ok(())
    }

    /// Process one item. Recoverable evaluation failures are logged and
    /// swallowed.
    pub fn handle(&mut self, item: WorkItem) -> Result<(), EvalError> {
        match item {
            WorkItem::Batch { flow, packets } => {
                let mut state = self.state(&flow).unwrap_or_default();
                let start = Instant::now();
                let result = self.evaluator.evaluate(&flow, &packets, &mut state);
                debug!("Inference took: {:.2} ms", start.elapsed().as_secs_f64() * 1e3);
                self.states.insert(flow, state);
                self.in_flight.remove(&flow);
                match result {
                    Ok(outcome) => {
                        debug!(
                            "Report for flow {}: {}, {}",
                            flow, state.label, outcome.decision
                        );
                        Ok(())
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!("Skipping flow {} this cycle: {}", flow, e);
                        Ok(())
                    }
                    Err(e) => {
                        error!("Inference failed due to an unexpected error: {}", e);
                        Err(e)
                    }
                }
            }
            WorkItem::Evict(flow) => {
                self.states.remove(&flow);
                Ok(())
            }
            WorkItem::Heartbeat => Ok(()),
        }
    }

    pub fn state(&self, flow: &FlowKey) -> Option<EvalState> {
        self.states.get(flow).map(|s| *s)
    }

    pub fn tracked_flows(&self) -> usize {
        self.states.len()
    }
}
