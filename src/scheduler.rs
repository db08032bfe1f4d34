//! The frame scheduler: registry ownership, worker lifecycle, per-frame
//! dispatch, and pacing (spec §4.4, §4.6, §6).

use crate::config::{SchedulerConfig, WorkerModel};
use crate::dependency_cache::{CacheSnapshot, DependencyCache};
use crate::double_buffer::Flippable;
use crate::error::{FrameAlreadyInFlight, GraphError, SchedulerStartError};
use crate::key::WorkUnitKey;
use crate::registry::Registry;
use crate::time::FrameInstant;
use crate::work_unit::{WorkUnitBody, WorkUnitHandle, WorkUnitKind, WorkUnitOutcome, WorkUnitState};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Outcome of one `do_one_frame` call, returned for instrumentation and
/// tests (spec §8 pacing/convergence properties read this back).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub elapsed_us: u64,
    pub carry_us: i64,
    pub units_failed: u32,
}

#[derive(Default)]
struct SchedulerMetrics {
    frames_completed: AtomicU64,
    failures_total: AtomicU64,
    frame_failures: AtomicU64,
    last_pacing_overrun_us: AtomicI64,
}

/// Snapshot of scheduler metrics, consumed by the built-in log aggregator
/// (spec §12.1 in `SPEC_FULL.md`) and available to any caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_completed: u64,
    pub failures_total: u64,
    pub last_pacing_overrun_us: i64,
}

/// Everything a persistent worker thread needs that outlives any single
/// `do_one_frame` call. Owned behind its own `Arc` so worker threads never
/// hold an `Arc<FrameScheduler>` — that would be a reference cycle, since
/// `FrameScheduler` itself owns the `JoinHandle`s.
struct SchedulerCore {
    registry: RwLock<Registry>,
    cache: DependencyCache,
    flippables: Mutex<Vec<Arc<dyn Flippable>>>,
    metrics: SchedulerMetrics,
}

struct FrameCycle {
    frame: u64,
    snapshot: Arc<CacheSnapshot>,
}

struct PersistentWorkers {
    start_barrier: Arc<Barrier>,
    end_barrier: Arc<Barrier>,
    shutdown: Arc<AtomicBool>,
    cycle: Arc<Mutex<Option<FrameCycle>>>,
    handles: Vec<JoinHandle<()>>,
}

/// Owns the work-unit registry, the dependency cache, worker-thread
/// lifecycle, and per-frame pacing state (spec §3 "Frame Scheduler
/// State").
pub struct FrameScheduler {
    core: Arc<SchedulerCore>,
    config: RwLock<SchedulerConfig>,
    frame_index: AtomicU64,
    carry_us: AtomicI64,
    pause_remaining_us: AtomicU64,
    frame_in_flight: AtomicBool,
    persistent: Mutex<Option<PersistentWorkers>>,
}

impl FrameScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                registry: RwLock::new(Registry::new()),
                cache: DependencyCache::new(),
                flippables: Mutex::new(Vec::new()),
                metrics: SchedulerMetrics::default(),
            }),
            config: RwLock::new(config),
            frame_index: AtomicU64::new(0),
            carry_us: AtomicI64::new(0),
            pause_remaining_us: AtomicU64::new(0),
            frame_in_flight: AtomicBool::new(false),
            persistent: Mutex::new(None),
        }
    }

    // ---- registration (legal only between frames) ----------------------

    pub fn add_work_unit(
        &self,
        name: impl Into<String>,
        kind: WorkUnitKind,
        dependencies: Vec<WorkUnitHandle>,
        body: WorkUnitBody,
    ) -> Result<WorkUnitHandle, GraphError> {
        let history_length = self.config.read().history_length;
        let mut registry = self
            .core
            .registry
            .try_write()
            .ok_or(GraphError::ModifiedDuringFrame)?;
        let handle = registry.insert(name.into(), kind, dependencies, body, history_length)?;
        self.core.cache.mark_dirty();
        Ok(handle)
    }

    pub fn add_dependency(
        &self,
        dependent: WorkUnitHandle,
        predecessor: WorkUnitHandle,
    ) -> Result<(), GraphError> {
        let mut registry = self
            .core
            .registry
            .try_write()
            .ok_or(GraphError::ModifiedDuringFrame)?;
        registry.add_dependency(dependent, predecessor)?;
        self.core.cache.mark_dirty();
        Ok(())
    }

    pub fn remove_work_unit(&self, handle: WorkUnitHandle) -> Result<(), GraphError> {
        let mut registry = self
            .core
            .registry
            .try_write()
            .ok_or(GraphError::ModifiedDuringFrame)?;
        registry.remove(handle)?;
        self.core.cache.mark_dirty();
        Ok(())
    }

    /// Register a double-buffered resource to be flipped at every frame
    /// start. Accepted at any time; takes effect starting the next frame.
    pub fn register_flippable(&self, flippable: Arc<dyn Flippable>) {
        self.core.flippables.lock().push(flippable);
    }

    pub fn update_dependency_cache(&self) {
        let registry = self.core.registry.read();
        self.core.cache.rebuild(&registry);
    }

    /// `rebuild_cache == false` leaves the currently cached sequence in
    /// place — it is already sorted by `update_dependency_cache`, so there
    /// is nothing further to do; the flag exists to match spec §6's
    /// interface and to let a caller skip the rebuild cost when it knows
    /// the graph has not changed.
    pub fn sort_work_units(&self, rebuild_cache: bool) {
        if rebuild_cache {
            self.update_dependency_cache();
        }
    }

    // ---- configuration (legal only between frames) ----------------------

    pub fn set_thread_count(&self, n: usize) -> Result<(), FrameAlreadyInFlight> {
        self.guard_idle()?;
        self.config.write().thread_count = n.max(1);
        Ok(())
    }

    pub fn set_frame_length_us(&self, microseconds: u64) -> Result<(), FrameAlreadyInFlight> {
        self.guard_idle()?;
        self.config.write().frame_length_us = microseconds.max(1);
        Ok(())
    }

    pub fn set_history_length(&self, samples: usize) -> Result<(), FrameAlreadyInFlight> {
        self.guard_idle()?;
        let samples = samples.max(1);
        self.config.write().history_length = samples;
        self.core.registry.read().resize_all_histories(samples);
        Ok(())
    }

    fn guard_idle(&self) -> Result<(), FrameAlreadyInFlight> {
        if self.frame_in_flight.load(Ordering::Acquire) {
            Err(FrameAlreadyInFlight)
        } else {
            Ok(())
        }
    }

    /// Observable during the end-of-frame pause; 0 at all other times
    /// (spec §6).
    pub fn pause_remaining_microseconds(&self) -> u64 {
        self.pause_remaining_us.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_completed: self.core.metrics.frames_completed.load(Ordering::Relaxed),
            failures_total: self.core.metrics.failures_total.load(Ordering::Relaxed),
            last_pacing_overrun_us: self
                .core
                .metrics
                .last_pacing_overrun_us
                .load(Ordering::Relaxed),
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Spawn the persistent worker pool, if `worker_model == Persistent`.
    /// A no-op (but not an error) under the per-frame model, which spawns
    /// its threads fresh inside every `do_one_frame` call instead.
    pub fn start(&self) -> Result<(), SchedulerStartError> {
        let mut persistent_guard = self.persistent.lock();
        if persistent_guard.is_some() {
            return Err(SchedulerStartError::AlreadyRunning);
        }
        let config = self.config.read().clone();
        if config.worker_model != WorkerModel::Persistent {
            return Ok(());
        }

        let worker_count = config.thread_count.saturating_sub(1);
        let start_barrier = Arc::new(Barrier::new(config.thread_count.max(1)));
        let end_barrier = Arc::new(Barrier::new(config.thread_count.max(1)));
        let shutdown = Arc::new(AtomicBool::new(false));
        let cycle: Arc<Mutex<Option<FrameCycle>>> = Arc::new(Mutex::new(None));

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let core = Arc::clone(&self.core);
            let start_barrier = Arc::clone(&start_barrier);
            let end_barrier = Arc::clone(&end_barrier);
            let shutdown = Arc::clone(&shutdown);
            let cycle = Arc::clone(&cycle);
            let handle = std::thread::Builder::new()
                .name(format!("frame-scheduler-worker-{index}"))
                .spawn(move || loop {
                    start_barrier.wait();
                    if shutdown.load(Ordering::Acquire) {
                        end_barrier.wait();
                        break;
                    }
                    let frame_cycle = cycle
                        .lock()
                        .as_ref()
                        .map(|c| (c.frame, Arc::clone(&c.snapshot)))
                        .expect("frame cycle published before start barrier release");
                    let registry = core.registry.read();
                    run_sequence_to_drain(
                        &registry,
                        &frame_cycle.1.non_affinity_order,
                        frame_cycle.0,
                        &core.metrics,
                    );
                    drop(registry);
                    end_barrier.wait();
                })
                .map_err(SchedulerStartError::ThreadSpawn)?;
            handles.push(handle);
        }

        *persistent_guard = Some(PersistentWorkers {
            start_barrier,
            end_barrier,
            shutdown,
            cycle,
            handles,
        });
        Ok(())
    }

    /// Signal and join the persistent worker pool. Safe to call whether or
    /// not `start` spawned anything. Called automatically on drop.
    pub fn stop(&self) {
        let Some(mut workers) = self.persistent.lock().take() else {
            return;
        };
        workers.shutdown.store(true, Ordering::Release);
        workers.start_barrier.wait();
        workers.end_barrier.wait();
        for handle in workers.handles.drain(..) {
            let _ = handle.join();
        }
    }

    // ---- per-frame dispatch -----------------------------------------------

    /// Execute exactly one frame end-to-end, blocking until it returns
    /// (spec §6 `do_one_frame`).
    #[instrument(skip(self), fields(frame))]
    pub fn do_one_frame(&self) -> Result<FrameReport, FrameAlreadyInFlight> {
        if self.frame_in_flight.swap(true, Ordering::AcqRel) {
            return Err(FrameAlreadyInFlight);
        }
        let report = self.run_frame();
        self.frame_in_flight.store(false, Ordering::Release);
        Ok(report)
    }

    fn run_frame(&self) -> FrameReport {
        let frame_start = FrameInstant::now();
        let current_frame = self.frame_index.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::Span::current().record("frame", &current_frame);

        if self.core.cache.is_dirty() {
            self.update_dependency_cache();
        }
        let snapshot = self.core.cache.snapshot();
        let config = self.config.read().clone();

        self.core.metrics.frame_failures.store(0, Ordering::Relaxed);
        let registry = self.core.registry.read();
        for (_, unit) in registry.iter() {
            unit.reset_for_frame();
        }
        for flippable in self.core.flippables.lock().iter() {
            flippable.flip();
        }

        run_monopoly_phase(&registry, current_frame, &self.core.metrics);

        match config.worker_model {
            WorkerModel::PerFrame => {
                self.run_parallel_per_frame(&registry, &snapshot, current_frame, config.thread_count)
            }
            WorkerModel::Persistent => self.run_parallel_persistent(&registry, &snapshot, current_frame),
        }

        drop(registry);

        let elapsed_us = FrameInstant::now().micros_since(frame_start);
        let units_failed = self.core.metrics.frame_failures.load(Ordering::Relaxed);
        self.core.metrics.frames_completed.fetch_add(1, Ordering::Relaxed);

        let carry_us = self.pace_frame_end(config.frame_length_us, elapsed_us, config.max_carry_us);

        FrameReport {
            frame_index: current_frame,
            elapsed_us,
            carry_us,
            units_failed: units_failed as u32,
        }
    }

    fn run_parallel_per_frame(
        &self,
        registry: &Registry,
        snapshot: &Arc<CacheSnapshot>,
        current_frame: u64,
        thread_count: usize,
    ) {
        let worker_count = thread_count.saturating_sub(1);
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let metrics = &self.core.metrics;
                scope.spawn(move || {
                    run_sequence_to_drain(registry, &snapshot.non_affinity_order, current_frame, metrics);
                });
            }
            run_main_thread_loop(registry, snapshot, current_frame, &self.core.metrics);
        });
    }

    fn run_parallel_persistent(
        &self,
        registry: &Registry,
        snapshot: &Arc<CacheSnapshot>,
        current_frame: u64,
    ) {
        let guard = self.persistent.lock();
        let Some(workers) = guard.as_ref() else {
            // `start()` was never called under the persistent model: fall
            // back to running everything on the main thread alone, which
            // is still correct, just serial.
            drop(guard);
            run_main_thread_loop(registry, snapshot, current_frame, &self.core.metrics);
            return;
        };

        *workers.cycle.lock() = Some(FrameCycle {
            frame: current_frame,
            snapshot: Arc::clone(snapshot),
        });
        workers.start_barrier.wait();
        run_main_thread_loop(registry, snapshot, current_frame, &self.core.metrics);
        workers.end_barrier.wait();
    }

    fn pace_frame_end(&self, target_us: u64, elapsed_us: u64, max_carry_us: i64) -> i64 {
        let carry = self.carry_us.load(Ordering::Acquire);
        let target = target_us as i64;
        let elapsed = elapsed_us as i64;
        let sleep_us = (target - elapsed + carry).max(0);

        self.pause_remaining_us.store(sleep_us as u64, Ordering::Release);
        let slept = if sleep_us > 0 {
            let before = FrameInstant::now();
            std::thread::sleep(Duration::from_micros(sleep_us as u64));
            FrameInstant::now().micros_since(before) as i64
        } else {
            0
        };
        self.pause_remaining_us.store(0, Ordering::Release);

        if elapsed > target {
            self.core
                .metrics
                .last_pacing_overrun_us
                .store(elapsed - target, Ordering::Relaxed);
            warn!(elapsed_us, target_us, "frame overran its pacing target");
        }

        let new_carry = ((target - elapsed) - slept).clamp(-max_carry_us, max_carry_us);
        self.carry_us.store(new_carry, Ordering::Release);
        new_carry
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(skip(registry, metrics), fields(frame = current_frame))]
fn run_monopoly_phase(registry: &Registry, current_frame: u64, metrics: &SchedulerMetrics) {
    for (_, unit) in registry.iter() {
        if !unit.kind().is_monopoly() {
            continue;
        }
        if !unit.is_ready_candidate(current_frame) {
            continue;
        }
        if !dependencies_satisfied(unit.dependencies(), registry, current_frame) {
            debug!(unit = unit.name(), "monopoly unit skipped: unmet dependency");
            continue;
        }
        if unit.try_start(current_frame) {
            execute_unit(unit, current_frame, metrics);
        }
    }
}

fn run_main_thread_loop(
    registry: &Registry,
    snapshot: &CacheSnapshot,
    current_frame: u64,
    metrics: &SchedulerMetrics,
) {
    loop {
        let mut advanced = false;
        advanced |= scan_once(registry, &snapshot.main_affinity_order, current_frame, metrics);
        advanced |= scan_once(registry, &snapshot.non_affinity_order, current_frame, metrics);

        if !advanced
            && !sequence_has_in_flight(registry, &snapshot.main_affinity_order)
            && !sequence_has_in_flight(registry, &snapshot.non_affinity_order)
        {
            let mut memo = HashMap::new();
            let pending_main =
                sequence_has_pending_work(registry, &snapshot.main_affinity_order, current_frame, &mut memo);
            let pending_other =
                sequence_has_pending_work(registry, &snapshot.non_affinity_order, current_frame, &mut memo);
            if !pending_main && !pending_other {
                break;
            }
        }
        std::hint::spin_loop();
    }
}

fn run_sequence_to_drain(
    registry: &Registry,
    sequence: &[(WorkUnitKey, WorkUnitHandle)],
    current_frame: u64,
    metrics: &SchedulerMetrics,
) {
    loop {
        let advanced = scan_once(registry, sequence, current_frame, metrics);
        if !advanced && !sequence_has_in_flight(registry, sequence) {
            let mut memo = HashMap::new();
            if !sequence_has_pending_work(registry, sequence, current_frame, &mut memo) {
                break;
            }
        }
        std::hint::spin_loop();
    }
}

/// One pass over `sequence`: try to acquire and run every ready candidate.
/// Returns whether any unit was actually started this pass.
fn scan_once(
    registry: &Registry,
    sequence: &[(WorkUnitKey, WorkUnitHandle)],
    current_frame: u64,
    metrics: &SchedulerMetrics,
) -> bool {
    let mut advanced = false;
    for (_, handle) in sequence {
        let Some(unit) = registry.get(*handle) else {
            continue;
        };
        if !unit.is_ready_candidate(current_frame) {
            continue;
        }
        if !dependencies_satisfied(unit.dependencies(), registry, current_frame) {
            continue;
        }
        if unit.try_start(current_frame) {
            execute_unit(unit, current_frame, metrics);
            advanced = true;
        }
    }
    advanced
}

fn dependencies_satisfied(
    dependencies: &[WorkUnitHandle],
    registry: &Registry,
    current_frame: u64,
) -> bool {
    dependencies.iter().all(|dep| match registry.get(*dep) {
        None => true,
        Some(d) => d.finished_this_frame(current_frame),
    })
}

fn sequence_has_in_flight(registry: &Registry, sequence: &[(WorkUnitKey, WorkUnitHandle)]) -> bool {
    sequence.iter().any(|(_, h)| match registry.get(*h) {
        Some(u) => u.is_in_flight(),
        None => false,
    })
}

/// True if some unit in `sequence` could still run this frame: it has not
/// finished, is not Failed, and none of its transitive dependencies are
/// permanently blocked (Failed or themselves permanently blocked). This is
/// what lets a worker's drain loop terminate even when a dependent of a
/// failed unit will sit in the ready-sentinel state forever (spec §8 S4).
fn sequence_has_pending_work(
    registry: &Registry,
    sequence: &[(WorkUnitKey, WorkUnitHandle)],
    current_frame: u64,
    memo: &mut HashMap<WorkUnitHandle, bool>,
) -> bool {
    sequence.iter().any(|(_, handle)| match registry.get(*handle) {
        None => false,
        Some(unit) => {
            !unit.finished_this_frame(current_frame)
                && unit.state() != WorkUnitState::Failed
                && !is_permanently_blocked(*handle, registry, current_frame, memo)
        }
    })
}

fn is_permanently_blocked(
    handle: WorkUnitHandle,
    registry: &Registry,
    current_frame: u64,
    memo: &mut HashMap<WorkUnitHandle, bool>,
) -> bool {
    if let Some(&cached) = memo.get(&handle) {
        return cached;
    }
    // Acyclicity is a registration-time invariant (`Registry::add_dependency`
    // rejects cycles), so inserting a provisional `false` before recursing
    // cannot be observed by anything but a genuine cycle.
    memo.insert(handle, false);
    let Some(unit) = registry.get(handle) else {
        return true;
    };
    let blocked = if unit.finished_this_frame(current_frame) {
        false
    } else if unit.state() == WorkUnitState::Failed {
        true
    } else {
        unit.dependencies()
            .iter()
            .any(|dep| is_permanently_blocked(*dep, registry, current_frame, memo))
    };
    memo.insert(handle, blocked);
    blocked
}

fn execute_unit(unit: &crate::work_unit::WorkUnit, current_frame: u64, metrics: &SchedulerMetrics) {
    unit.mark_running();
    let start = FrameInstant::now();
    let outcome = {
        let mut body = unit.body.lock();
        body()
    };
    let elapsed_us = FrameInstant::now().micros_since(start);
    unit.finish(outcome, elapsed_us, current_frame);

    if outcome == WorkUnitOutcome::Failed {
        metrics.failures_total.fetch_add(1, Ordering::Relaxed);
        metrics.frame_failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(unit = unit.name(), "work unit failed");
    }
}
