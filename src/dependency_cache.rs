//! Derived reverse-edge map and cached sort keys (spec §3, §4.3).
//!
//! Rebuilding replaces an `Arc<CacheSnapshot>` behind a lock rather than
//! mutating the live sequence in place: the scheduler takes one snapshot
//! at frame start and every worker dispatches against that same `Arc` for
//! the whole frame, so a rebuild triggered mid-frame by the built-in
//! sorter work unit (spec §4.3: "amortized off the critical path") never
//! perturbs the sequence threads are actively scanning — it only takes
//! effect starting the following frame.

use crate::key::WorkUnitKey;
use crate::registry::Registry;
use crate::work_unit::WorkUnitHandle;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Immutable dispatch order plus the dependent-count map it was derived
/// from, as of the last `rebuild`.
pub struct CacheSnapshot {
    pub dependents: HashMap<WorkUnitHandle, u32>,
    pub main_affinity_order: Vec<(WorkUnitKey, WorkUnitHandle)>,
    pub non_affinity_order: Vec<(WorkUnitKey, WorkUnitHandle)>,
}

impl CacheSnapshot {
    fn empty() -> Self {
        Self {
            dependents: HashMap::new(),
            main_affinity_order: Vec::new(),
            non_affinity_order: Vec::new(),
        }
    }
}

pub struct DependencyCache {
    dirty: AtomicBool,
    snapshot: RwLock<Arc<CacheSnapshot>>,
}

impl Default for DependencyCache {
    fn default() -> Self {
        Self {
            dirty: AtomicBool::new(true),
            snapshot: RwLock::new(Arc::new(CacheSnapshot::empty())),
        }
    }
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshot.read().clone()
    }

    /// Rebuild dependent counts and the two sorted dispatch sequences.
    /// Monopoly units are excluded — they never enter the acquisition
    /// scan (spec §4.4 runs them serially in the monopoly phase).
    pub fn rebuild(&self, registry: &Registry) {
        let dependents = transitive_dependent_counts(registry);

        let mut main_affinity = Vec::new();
        let mut non_affinity = Vec::new();
        for (handle, unit) in registry.iter() {
            if unit.kind().is_monopoly() {
                continue;
            }
            let key = WorkUnitKey {
                dependents: *dependents.get(&handle).unwrap_or(&0),
                perf_sample_us: unit.perf_sample_us(),
                handle,
            };
            if unit.kind().is_main_affinity() {
                main_affinity.push((key, handle));
            } else {
                non_affinity.push((key, handle));
            }
        }
        main_affinity.sort_by_key(|(key, _)| *key);
        non_affinity.sort_by_key(|(key, _)| *key);

        *self.snapshot.write() = Arc::new(CacheSnapshot {
            dependents,
            main_affinity_order: main_affinity,
            non_affinity_order: non_affinity,
        });
        self.dirty.store(false, Ordering::Release);
    }
}

/// For every unit `x`, the number of units reachable by following
/// dependent edges (the reverse of the stored predecessor edges) from
/// `x` — i.e. everything that transitively waits on `x`. This is the
/// "transitive" choice spec §4.3/§9 calls out as either admissible; see
/// `DESIGN.md` for why it was picked over the immediate count.
fn transitive_dependent_counts(registry: &Registry) -> HashMap<WorkUnitHandle, u32> {
    let mut reverse: HashMap<WorkUnitHandle, Vec<WorkUnitHandle>> = HashMap::new();
    for (handle, unit) in registry.iter() {
        for &predecessor in unit.dependencies() {
            reverse.entry(predecessor).or_default().push(handle);
        }
    }

    let mut counts = HashMap::new();
    for (handle, _) in registry.iter() {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        if let Some(direct) = reverse.get(&handle) {
            queue.extend(direct.iter().copied());
        }
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = reverse.get(&node) {
                queue.extend(next.iter().copied());
            }
        }
        counts.insert(handle, seen.len() as u32);
    }
    counts
}
