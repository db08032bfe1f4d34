//! The work-unit state machine (spec §3, §4.1).

use crate::rolling_average::RollingAverage;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a registered work unit. Equality and hashing are by
/// handle only, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkUnitHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Outcome a work-unit body reports on return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnitOutcome {
    Completed,
    Failed,
}

/// The body a thread invokes once it wins acquisition. Must be `Send`
/// since, across frames, a unit may run on a different thread each time —
/// never concurrently, per the acquisition protocol.
pub type WorkUnitBody = Box<dyn FnMut() -> WorkUnitOutcome + Send>;

/// Publicly observable state, exactly the four values spec §3/§4.1 name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkUnitState {
    Complete = 0,
    Starting = 1,
    Running = 2,
    Failed = 3,
}

impl WorkUnitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => WorkUnitState::Complete,
            1 => WorkUnitState::Starting,
            2 => WorkUnitState::Running,
            3 => WorkUnitState::Failed,
            other => unreachable!("invalid work unit state byte {other}"),
        }
    }
}

/// How a work unit is scheduled. `Async` still participates in the normal
/// dispatch sequences (spec §4.4 point 5: its node is an ordinary poller
/// that steers a background thread the unit's own body owns); the tag
/// only distinguishes it for the `is_main_affinity` check below. The
/// background thread itself is owned and joined by whatever
/// `AsyncWorkUnit<T>` the body closure captures (see
/// `async_work_unit.rs`'s `Drop` impl) — the scheduler has no handle to
/// it and does not join it on its own drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnitKind {
    Normal,
    MainAffinity,
    Monopoly,
    Async { main_affinity: bool },
}

impl WorkUnitKind {
    pub(crate) fn is_monopoly(self) -> bool {
        matches!(self, WorkUnitKind::Monopoly)
    }

    pub(crate) fn is_main_affinity(self) -> bool {
        matches!(self, WorkUnitKind::MainAffinity)
            || matches!(self, WorkUnitKind::Async { main_affinity: true })
    }
}

/// A registered node: performance history, dependency list, and the
/// acquire/execute/finish state machine. Dependencies are append-only
/// while no frame is in flight (spec §4.2) and the list is otherwise
/// read-only during a frame.
/// Number of bits of `word` given to the `WorkUnitState` tag; the rest
/// hold the frame index. Kept private to this module.
const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = 0b11;

fn encode_word(state: WorkUnitState, frame: u64) -> u64 {
    (frame << STATE_BITS) | (state as u64 & STATE_MASK)
}

fn decode_word(word: u64) -> (WorkUnitState, u64) {
    (
        WorkUnitState::from_raw((word & STATE_MASK) as u8),
        word >> STATE_BITS,
    )
}

pub struct WorkUnit {
    pub(crate) name: String,
    pub(crate) kind: WorkUnitKind,
    pub(crate) dependencies: Vec<WorkUnitHandle>,
    pub(crate) body: Mutex<WorkUnitBody>,

    /// State tag and "last finished at frame N" packed into one word (see
    /// `encode_word`/`decode_word`). Both spec §4.1 meanings of
    /// `WorkUnitState::Complete` — "ready sentinel" and "finished this
    /// frame" — collapse onto the same state tag, so telling them apart
    /// needs a frame stamp; packing it alongside the tag in a single
    /// atomic makes the "is Complete and not already finished this frame"
    /// guard and the Complete -> Starting transition one atomic op instead
    /// of two, which is what keeps `try_start` race-free: a read-then-CAS
    /// over two separate atomics would let another thread finish and
    /// reset the unit between the read and the CAS, re-firing it the same
    /// frame.
    ///
    /// Cache-line padded (spec §9 "Node size"): this word is read by every
    /// scanning thread's acquisition pass every frame, so keeping it off a
    /// cache line shared with anything else avoids false sharing across
    /// workers scanning neighboring units.
    word: CachePadded<AtomicU64>,
    perf_sample_us: AtomicU64,
    history: Mutex<RollingAverage>,
}

impl WorkUnit {
    pub(crate) fn new(
        name: String,
        kind: WorkUnitKind,
        dependencies: Vec<WorkUnitHandle>,
        body: WorkUnitBody,
        history_length: usize,
    ) -> Self {
        Self {
            name,
            kind,
            dependencies,
            body: Mutex::new(body),
            word: CachePadded::new(AtomicU64::new(encode_word(WorkUnitState::Complete, 0))),
            perf_sample_us: AtomicU64::new(0),
            history: Mutex::new(RollingAverage::new(history_length)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> WorkUnitKind {
        self.kind
    }

    pub fn dependencies(&self) -> &[WorkUnitHandle] {
        &self.dependencies
    }

    pub fn state(&self) -> WorkUnitState {
        decode_word(self.word.load(Ordering::Acquire)).0
    }

    pub fn perf_sample_us(&self) -> u64 {
        self.perf_sample_us.load(Ordering::Relaxed)
    }

    /// Reset to the ready sentinel for a new frame. Called by the
    /// scheduler only, at frame start, before any worker can observe it,
    /// so no other thread can be racing this read-modify-write.
    pub(crate) fn reset_for_frame(&self) {
        let (_, frame) = decode_word(self.word.load(Ordering::Acquire));
        self.word
            .store(encode_word(WorkUnitState::Complete, frame), Ordering::Release);
    }

    /// True if this unit has not yet been claimed for `current_frame`,
    /// i.e. it is still showing the ready sentinel rather than a result
    /// actually published this frame.
    pub(crate) fn is_ready_candidate(&self, current_frame: u64) -> bool {
        let (state, frame) = decode_word(self.word.load(Ordering::Acquire));
        state == WorkUnitState::Complete && frame != current_frame
    }

    /// True if this unit genuinely finished (Complete, not Failed) during
    /// `current_frame` — the predecessor-satisfaction test of spec §4.1.
    pub(crate) fn finished_this_frame(&self, current_frame: u64) -> bool {
        let (state, frame) = decode_word(self.word.load(Ordering::Acquire));
        state == WorkUnitState::Complete && frame == current_frame
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        let (state, _) = decode_word(self.word.load(Ordering::Acquire));
        matches!(state, WorkUnitState::Starting | WorkUnitState::Running)
    }

    /// Attempt the Complete -> Starting transition, but only if this unit
    /// has not already finished `current_frame`. Returns true exactly
    /// once per frame, to exactly one caller (spec §4.1).
    pub(crate) fn try_start(&self, current_frame: u64) -> bool {
        let mut old = self.word.load(Ordering::Acquire);
        loop {
            let (state, frame) = decode_word(old);
            if state != WorkUnitState::Complete || frame == current_frame {
                return false;
            }
            let new = encode_word(WorkUnitState::Starting, frame);
            match self
                .word
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => old = actual,
            }
        }
    }

    pub(crate) fn mark_running(&self) {
        let (_, frame) = decode_word(self.word.load(Ordering::Acquire));
        self.word
            .store(encode_word(WorkUnitState::Running, frame), Ordering::Release);
    }

    /// Publish the outcome with release semantics and fold the elapsed
    /// runtime into the performance sample. Must be called by the same
    /// thread that won `try_start`.
    pub(crate) fn finish(&self, outcome: WorkUnitOutcome, elapsed_us: u64, current_frame: u64) {
        {
            let mut history = self.history.lock();
            history.push(elapsed_us);
            self.perf_sample_us
                .store(history.mean_us(), Ordering::Relaxed);
        }
        let next_state = match outcome {
            WorkUnitOutcome::Completed => WorkUnitState::Complete,
            WorkUnitOutcome::Failed => WorkUnitState::Failed,
        };
        self.word
            .store(encode_word(next_state, current_frame), Ordering::Release);
    }

    pub(crate) fn resize_history(&self, new_len: usize) {
        self.history.lock().resize(new_len);
    }
}
