//! Work-unit registration and the forward dependency graph (spec §4.2).
//!
//! Only forward edges (`u` depends on `v`) are stored on each node, which
//! is what keeps a node small and makes edge insertion O(1); the reverse
//! (dependent) projection lives entirely in [`crate::dependency_cache`].

use crate::error::GraphError;
use crate::work_unit::{WorkUnit, WorkUnitBody, WorkUnitHandle, WorkUnitKind};

struct Slot {
    unit: WorkUnit,
    generation: u32,
}

/// Owns every registered work unit. Mutation methods require `&mut self`
/// and are only ever called through the scheduler's `try_write` guard
/// (see `scheduler.rs`), which is what enforces spec §4.2/§6's "legal
/// only between frames" rule at runtime.
#[derive(Default)]
pub struct Registry {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        name: String,
        kind: WorkUnitKind,
        dependencies: Vec<WorkUnitHandle>,
        body: WorkUnitBody,
        history_length: usize,
    ) -> Result<WorkUnitHandle, GraphError> {
        for dep in &dependencies {
            if self.get(*dep).is_none() {
                // `unit` handle isn't known yet (we haven't allocated the
                // slot), so report the dangling side only via the
                // predecessor — the caller knows which unit it was
                // registering.
                return Err(GraphError::UnknownHandle(*dep));
            }
        }

        let unit = WorkUnit::new(name, kind, dependencies, body, history_length);

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = slot.as_ref().map(|s| s.generation + 1).unwrap_or(0);
            *slot = Some(Slot { unit, generation });
            Ok(WorkUnitHandle { index, generation })
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(Slot { unit, generation: 0 }));
            Ok(WorkUnitHandle {
                index,
                generation: 0,
            })
        }
    }

    pub fn add_dependency(
        &mut self,
        dependent: WorkUnitHandle,
        predecessor: WorkUnitHandle,
    ) -> Result<(), GraphError> {
        self.get(predecessor)
            .ok_or(GraphError::DanglingPredecessor {
                unit: dependent,
                predecessor,
            })?;
        if self.get(dependent).is_none() {
            return Err(GraphError::UnknownHandle(dependent));
        }

        if let Some(path) = self.path_between(predecessor, dependent) {
            return Err(GraphError::CycleDetected {
                unit: dependent,
                predecessor,
                path,
            });
        }

        let slot = self.slot_mut(dependent).expect("validated above");
        slot.unit.dependencies.push(predecessor);
        Ok(())
    }

    pub fn remove(&mut self, handle: WorkUnitHandle) -> Result<(), GraphError> {
        self.get(handle).ok_or(GraphError::UnknownHandle(handle))?;
        self.slots[handle.index as usize] = None;
        self.free.push(handle.index);

        for slot in self.slots.iter_mut().flatten() {
            slot.unit.dependencies.retain(|dep| *dep != handle);
        }
        Ok(())
    }

    pub fn resize_all_histories(&self, new_len: usize) {
        for (_, unit) in self.iter() {
            unit.resize_history(new_len);
        }
    }

    pub fn get(&self, handle: WorkUnitHandle) -> Option<&WorkUnit> {
        self.slots
            .get(handle.index as usize)?
            .as_ref()
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &slot.unit)
    }

    fn slot_mut(&mut self, handle: WorkUnitHandle) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(handle.index as usize)?.as_mut()?;
        if slot.generation == handle.generation {
            Some(slot)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (WorkUnitHandle, &WorkUnit)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref().map(|s| {
                (
                    WorkUnitHandle {
                        index: index as u32,
                        generation: s.generation,
                    },
                    &s.unit,
                )
            })
        })
    }

    /// DFS from `from` along dependency edges looking for `to`; used to
    /// reject an `add_dependency` call that would introduce a cycle.
    /// Returns the offending path (from -> ... -> to) if found.
    fn path_between(
        &self,
        from: WorkUnitHandle,
        to: WorkUnitHandle,
    ) -> Option<Vec<WorkUnitHandle>> {
        if from == to {
            return Some(vec![from]);
        }
        let mut stack = vec![(from, vec![from])];
        let mut seen = std::collections::HashSet::new();
        while let Some((node, path)) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            let Some(unit) = self.get(node) else {
                continue;
            };
            for &dep in unit.dependencies() {
                if dep == to {
                    let mut path = path.clone();
                    path.push(dep);
                    return Some(path);
                }
                let mut path = path.clone();
                path.push(dep);
                stack.push((dep, path));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_unit::WorkUnitOutcome;

    fn noop_body() -> WorkUnitBody {
        Box::new(|| WorkUnitOutcome::Completed)
    }

    #[test]
    fn insert_rejects_dangling_predecessor() {
        let mut reg = Registry::new();
        let bogus = WorkUnitHandle {
            index: 99,
            generation: 0,
        };
        let err = reg
            .insert("a".into(), WorkUnitKind::Normal, vec![bogus], noop_body(), 8)
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownHandle(_)));
    }

    #[test]
    fn add_dependency_rejects_cycles() {
        let mut reg = Registry::new();
        let a = reg
            .insert("a".into(), WorkUnitKind::Normal, vec![], noop_body(), 8)
            .unwrap();
        let b = reg
            .insert("b".into(), WorkUnitKind::Normal, vec![a], noop_body(), 8)
            .unwrap();
        let err = reg.add_dependency(a, b).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn remove_scrubs_dependents() {
        let mut reg = Registry::new();
        let a = reg
            .insert("a".into(), WorkUnitKind::Normal, vec![], noop_body(), 8)
            .unwrap();
        let b = reg
            .insert("b".into(), WorkUnitKind::Normal, vec![a], noop_body(), 8)
            .unwrap();
        reg.remove(a).unwrap();
        assert!(reg.get(b).unwrap().dependencies().is_empty());
        assert!(reg.get(a).is_none());
    }

    #[test]
    fn removed_slot_handle_is_stale_after_reuse() {
        let mut reg = Registry::new();
        let a = reg
            .insert("a".into(), WorkUnitKind::Normal, vec![], noop_body(), 8)
            .unwrap();
        reg.remove(a).unwrap();
        let c = reg
            .insert("c".into(), WorkUnitKind::Normal, vec![], noop_body(), 8)
            .unwrap();
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
        assert!(reg.get(a).is_none());
        assert!(reg.get(c).is_some());
    }
}
