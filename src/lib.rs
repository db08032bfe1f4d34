//! A deterministic, per-frame DAG work-unit scheduler for soft-real-time
//! interactive applications.
//!
//! A static set of user-supplied work units, related by a directed
//! acyclic dependency graph, is executed once per "frame" across a pool
//! of worker threads, paced to a configured target frame duration. See
//! [`scheduler::FrameScheduler`] for the entry point.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod async_work_unit;
pub mod builtin;
pub mod config;
pub mod dependency_cache;
pub mod double_buffer;
pub mod error;
pub mod key;
pub mod registry;
pub mod rolling_average;
pub mod scheduler;
pub mod time;
pub mod work_unit;

pub use config::{SchedulerConfig, WorkerModel};
pub use error::{ConfigError, FrameAlreadyInFlight, GraphError, SchedulerStartError};
pub use scheduler::{FrameReport, FrameScheduler, MetricsSnapshot};
pub use work_unit::{WorkUnitHandle, WorkUnitKind, WorkUnitOutcome, WorkUnitState};
