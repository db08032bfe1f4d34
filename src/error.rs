//! Error surfaces for the scheduler's lifecycle and graph-mutation calls.
//!
//! Work-unit body failures are never represented here — they are captured
//! in-band as the `Failed` state (see [`crate::work_unit::WorkUnitState`])
//! and reported through `tracing`, matching spec §7's split between
//! "structural" errors (surfaced to the caller) and "body" failures
//! (absorbed and logged).

use crate::work_unit::WorkUnitHandle;
use thiserror::Error;

/// Errors returned by graph-structure mutation calls
/// (`add_work_unit`, `add_dependency`, `remove_work_unit`,
/// `update_dependency_cache`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("work unit {0:?} is not registered")]
    UnknownHandle(WorkUnitHandle),

    #[error("predecessor {predecessor:?} of {unit:?} is not registered")]
    DanglingPredecessor {
        unit: WorkUnitHandle,
        predecessor: WorkUnitHandle,
    },

    #[error("adding predecessor {predecessor:?} to {unit:?} would create a cycle: {path:?}")]
    CycleDetected {
        unit: WorkUnitHandle,
        predecessor: WorkUnitHandle,
        path: Vec<WorkUnitHandle>,
    },

    #[error("graph mutation attempted while a frame is in flight")]
    ModifiedDuringFrame,
}

/// Errors surfaced from scheduler lifecycle calls that acquire OS
/// resources (`start`).
#[derive(Debug, Error)]
pub enum SchedulerStartError {
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("scheduler is already started")]
    AlreadyRunning,
}

/// Returned by `do_one_frame` when a frame is requested while one is
/// already in flight on another call site (e.g. two threads racing to
/// drive the same scheduler).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("a frame is already in flight on this scheduler")]
pub struct FrameAlreadyInFlight;

/// Returned by `SchedulerConfig::validate`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker_count must be at least 1")]
    ZeroWorkers,

    #[error("target_frame_micros must be greater than 0")]
    ZeroFrameBudget,

    #[error("perf_history_length must be at least 1")]
    ZeroHistoryLength,

    #[error("max_carry_us must be non-zero for carry compensation to have any effect")]
    ZeroCarryBudget,
}
