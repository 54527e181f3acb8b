//! Feedback laws for moving a mitigated flow's target window

pub mod schedule;

use std::fmt;

use anyhow::Result;

pub use schedule::{Schedule, ScheduleError};

/// Additive step used by AIMD, one MSS per control interval.
pub const AIMD_STEP_BYTES: f64 = 1448.0;
pub const MIMD_INCREASE_FACTOR: f64 = 1.3;
pub const AIMD_DECREASE_DIVISOR: f64 = 2.0;
pub const MIMD_DECREASE_DIVISOR: f64 = 1.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionStrategy {
    Aimd,
    Mimd,
}

impl ReactionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aimd => "aimd",
            Self::Mimd => "mimd",
        }
    }

    pub fn get(name: &str) -> Result<Self> {
        match name {
            "aimd" => Ok(Self::Aimd),
            "mimd" => Ok(Self::Mimd),
            _ => anyhow::bail!("Unknown reaction strategy: {}", name),
        }
    }

    /// List all available strategies
    pub fn list() -> Vec<&'static str> {
        vec![Self::Aimd.name(), Self::Mimd.name()]
    }
}

impl fmt::Display for ReactionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Grow `current` according to `strategy`.
pub fn react_up(strategy: ReactionStrategy, current: f64) -> f64 {
    match strategy {
        ReactionStrategy::Aimd => current + AIMD_STEP_BYTES,
        ReactionStrategy::Mimd => current * MIMD_INCREASE_FACTOR,
    }
}

/// Shrink `current` according to `strategy`.
pub fn react_down(strategy: ReactionStrategy, current: f64) -> f64 {
    match strategy {
        ReactionStrategy::Aimd => current / AIMD_DECREASE_DIVISOR,
        ReactionStrategy::Mimd => current / MIMD_DECREASE_DIVISOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [f64; 6] = [1.0, 2.5, 1448.0, 65_535.0, 1e6, 4e9];

    #[test]
    fn up_grows_and_down_shrinks() {
        for strategy in [ReactionStrategy::Aimd, ReactionStrategy::Mimd] {
            for x in SAMPLES {
                assert!(react_up(strategy, x) > x, "{strategy} up {x}");
                assert!(react_down(strategy, x) < x, "{strategy} down {x}");
            }
        }
    }

    #[test]
    fn factors() {
        assert_eq!(react_down(ReactionStrategy::Aimd, 100_000.0), 50_000.0);
        assert_eq!(react_up(ReactionStrategy::Aimd, 100_000.0), 101_448.0);
        assert!((react_up(ReactionStrategy::Mimd, 1000.0) - 1300.0).abs() < 1e-9);
        assert!((react_down(ReactionStrategy::Mimd, 1750.0) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn registry() {
        assert_eq!(ReactionStrategy::get("aimd").unwrap(), ReactionStrategy::Aimd);
        assert_eq!(ReactionStrategy::get("mimd").unwrap(), ReactionStrategy::Mimd);
        assert!(ReactionStrategy::get("cubic").is_err());
        assert_eq!(ReactionStrategy::list(), vec!["aimd", "mimd"]);
    }
}
