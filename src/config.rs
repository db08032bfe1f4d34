//! Scheduler configuration (spec §5, `Configuration options recognised`).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// How worker threads are provisioned across frames (spec §4.4 point 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerModel {
    /// N-1 workers spawned once at `start` and parked on the start
    /// barrier between frames.
    Persistent,
    /// N-1 fresh threads spawned every frame and joined at frame end.
    PerFrame,
}

/// Tunables accepted at scheduler construction and, where noted, while
/// running via the `set_*` calls (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total logical workers including the main thread driving
    /// `do_one_frame`. Default: available parallelism.
    pub thread_count: usize,

    /// Target wall-clock duration of one frame, in microseconds.
    /// Default: 16_666 (60 Hz).
    pub frame_length_us: u64,

    /// Samples retained per work unit for the rolling performance
    /// average feeding the sort key. Default: 64.
    pub history_length: usize,

    /// Persistent vs. per-frame worker provisioning. Default: `Persistent`.
    pub worker_model: WorkerModel,

    /// Hint permitting the scheduler to skip cache-line flushes on large
    /// registries; advisory only, never changes scheduling outcomes.
    /// Default: false.
    pub cache_flush_optimization: bool,

    /// Bound on the magnitude of the accumulated pacing carry (spec §4.6),
    /// in microseconds. Prevents one extreme frame from perturbing many
    /// subsequent frames' sleeps. Default: one frame length.
    pub max_carry_us: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let frame_length_us = 16_666;
        Self {
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            frame_length_us,
            history_length: 64,
            worker_model: WorkerModel::Persistent,
            cache_flush_optimization: false,
            max_carry_us: frame_length_us as i64,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_frame_length_us(mut self, frame_length_us: u64) -> Self {
        self.frame_length_us = frame_length_us;
        self
    }

    pub fn with_history_length(mut self, history_length: usize) -> Self {
        self.history_length = history_length;
        self
    }

    pub fn with_worker_model(mut self, worker_model: WorkerModel) -> Self {
        self.worker_model = worker_model;
        self
    }

    pub fn with_cache_flush_optimization(mut self, enabled: bool) -> Self {
        self.cache_flush_optimization = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.frame_length_us == 0 {
            return Err(ConfigError::ZeroFrameBudget);
        }
        if self.history_length == 0 {
            return Err(ConfigError::ZeroHistoryLength);
        }
        if self.max_carry_us == 0 {
            return Err(ConfigError::ZeroCarryBudget);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_targets_sixty_hertz() {
        let config = SchedulerConfig::default();
        assert_eq!(config.frame_length_us, 16_666);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides_apply() {
        let config = SchedulerConfig::new()
            .with_thread_count(4)
            .with_frame_length_us(33_333)
            .with_history_length(16)
            .with_worker_model(WorkerModel::PerFrame);
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.frame_length_us, 33_333);
        assert_eq!(config.history_length, 16);
        assert_eq!(config.worker_model, WorkerModel::PerFrame);
    }

    #[test]
    fn zero_thread_count_rejected() {
        let config = SchedulerConfig::new().with_thread_count(0);
        assert_eq!(config.validate().unwrap_err(), ConfigError::ZeroWorkers);
    }

    #[test]
    fn zero_frame_length_rejected() {
        let config = SchedulerConfig::new().with_frame_length_us(0);
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::ZeroFrameBudget
        );
    }
}
