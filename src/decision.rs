//! Per-flow mitigation state machine.
//!
//! | label       | previous   | next                                   |
//! |-------------|------------|----------------------------------------|
//! | above fair  | any        | `Paced(react_down(bdp))`               |
//! | below fair  | `Paced(_)` | `Paced(react_up(bdp))`                 |
//! | below fair  | `NotPaced` | `NotPaced`                             |
//! | approx fair | `Paced(v)` | `Paced(v)`                             |
//! | approx fair | `NotPaced` | `NotPaced`                             |

use thiserror::Error;

use crate::reaction::{react_down, react_up, ReactionStrategy, Schedule};
use crate::{Decision, Label};

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("RWND must be in 1..={max}, but is {value}")]
    InvalidTarget { value: f64, max: u32 },
}

/// What a transition does to the flow's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Down,
    Up,
    Retain,
    Unpaced,
}

impl Reaction {
    pub fn needs_bdp(&self) -> bool {
        matches!(self, Self::Down | Self::Up)
    }
}

pub fn reaction(label: Label, previous: Decision) -> Reaction {
    match (label, previous) {
        (Label::AboveFair, _) => Reaction::Down,
        (Label::BelowFair, Decision::Paced(_)) => Reaction::Up,
        (Label::ApproxFair, Decision::Paced(_)) => Reaction::Retain,
        (Label::BelowFair | Label::ApproxFair, Decision::NotPaced) => Reaction::Unpaced,
    }
}

/// Next decision for a flow. `bdp_estimate` is only read when the window moves.
pub fn decide(
    label: Label,
    previous: Decision,
    bdp_estimate: f64,
    strategy: ReactionStrategy,
) -> Result<Decision, DecisionError> {
    match reaction(label, previous) {
        Reaction::Down => Ok(Decision::Paced(to_rwnd(react_down(strategy, bdp_estimate))?)),
        Reaction::Up => Ok(Decision::Paced(to_rwnd(react_up(strategy, bdp_estimate))?)),
        Reaction::Retain => Ok(previous),
        Reaction::Unpaced => Ok(Decision::NotPaced),
    }
}

/// Round a target window to the wire width. Non-positive or oversized
/// targets are a contract violation, not something to clamp.
pub fn to_rwnd(value: f64) -> Result<u32, DecisionError> {
    let rounded = value.round();
    if !(rounded >= 1.0 && rounded <= f64::from(u32::MAX)) {
        return Err(DecisionError::InvalidTarget {
            value,
            max: u32::MAX,
        });
    }
    Ok(rounded as u32)
}

/// Bandwidth-delay product in bytes, or `None` while the RTT is unknown.
pub fn bdp_bytes(throughput_bps: f64, min_rtt_us: u32) -> Option<f64> {
    if min_rtt_us == crate::features::MIN_RTT_UNKNOWN {
        return None;
    }
    Some(throughput_bps * f64::from(min_rtt_us) / 1e6)
}

/// Where mitigation values come from.
#[derive(Debug, Clone)]
pub enum Policy {
    /// Classifier labels drive the state machine above.
    React(ReactionStrategy),
    /// Windows follow a static schedule; classification is bypassed.
    Schedule(Schedule),
}

impl Policy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::React(strategy) => strategy.name(),
            Self::Schedule(_) => "file",
        }
    }
}
