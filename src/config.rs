use std::time::Duration;

use anyhow::{ensure, Result};

pub const DEFAULT_INTERVAL_MS: u64 = 500;
pub const DEFAULT_LIMIT: usize = 100;
pub const DEFAULT_BUFFER_CAP: usize = 100;
pub const DEFAULT_WINDOW: usize = 10;
/// Flows without a packet or evaluation for this long are garbage collected.
pub const DEFAULT_IDLE_SECS: u64 = 5 * 60;
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Tunables for the control loop and the inference pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between control cycles.
    pub interval: Duration,
    /// Packets a flow must accumulate before it is evaluated.
    pub limit: usize,
    /// Most packets buffered per flow between evaluations.
    pub buffer_cap: usize,
    /// Trailing feature rows handed to the classifier.
    pub window: usize,
    pub idle_threshold: Duration,
    /// Capacity of the channel feeding the inference worker.
    pub queue_depth: usize,
    pub disable_inference: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            limit: DEFAULT_LIMIT,
            buffer_cap: DEFAULT_BUFFER_CAP,
            window: DEFAULT_WINDOW,
            idle_threshold: Duration::from_secs(DEFAULT_IDLE_SECS),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            disable_inference: false,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.interval.is_zero(), "Interval must be greater than 0");
        ensure!(
            self.limit > 0,
            "Limit must be greater than 0 but is: {}",
            self.limit
        );
        ensure!(
            self.buffer_cap >= self.limit,
            "Buffer cap ({}) must be at least the limit ({})",
            self.buffer_cap,
            self.limit
        );
        ensure!(self.window > 0, "Window must be greater than 0");
        ensure!(self.queue_depth > 0, "Queue depth must be greater than 0");
        Ok(())
    }
}
