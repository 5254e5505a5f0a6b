//! Per-walker scratch storage for the step executors.
//!
//! One contiguous buffer per kind of scratch data, cut into equal slots keyed by walker index.
//! Executors address a walker's slot through an `ArenaHandle` (an offset, never a pointer) and
//! the arena is resized with the population after every branching pass.

use nalgebra::Vector3;
use rayon::prelude::*;

use crate::wavefunction::TrialState;
use super::mover::DriftPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaHandle {
    pub walker: usize,
    offset: usize,
    len: usize,
}

/// Mutable view of one walker's scratch slot.
pub struct ScratchSlot<'a> {
    /// Proposed positions for an all-electron move.
    pub proposed: &'a mut [Vector3<f64>],
    /// Drift policy chosen for this walker at the start of the step.
    pub drift: &'a mut DriftPolicy,
    /// Whether any move of this walker was accepted during the step.
    pub moved: &'a mut bool,
    /// Wavefunction state for a proposed all-electron configuration.
    pub trial: &'a mut Option<TrialState>,
}

#[derive(Debug, Default)]
pub struct ScratchArena {
    n_particles: usize,
    proposed: Vec<Vector3<f64>>,
    drifts: Vec<DriftPolicy>,
    moved: Vec<bool>,
    trials: Vec<Option<TrialState>>,
}

impl ScratchArena {
    pub fn new(n_particles: usize) -> Self {
        Self {
            n_particles: n_particles.max(1),
            ..Default::default()
        }
    }

    /// Number of walker slots.
    pub fn len(&self) -> usize {
        self.moved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }

    pub fn num_particles(&self) -> usize {
        self.n_particles
    }

    /// Grow or shrink to exactly `n_walkers` slots. Existing slots keep their contents.
    pub fn resize(&mut self, n_walkers: usize) {
        self.proposed.resize(n_walkers * self.n_particles, Vector3::zeros());
        self.drifts.resize(n_walkers, DriftPolicy::None);
        self.moved.resize(n_walkers, false);
        self.trials.resize_with(n_walkers, || None);
    }

    pub fn handle(&self, walker: usize) -> Option<ArenaHandle> {
        (walker < self.len()).then(|| ArenaHandle {
            walker,
            offset: walker * self.n_particles,
            len: self.n_particles,
        })
    }

    pub fn slot_mut(&mut self, handle: ArenaHandle) -> ScratchSlot<'_> {
        ScratchSlot {
            proposed: &mut self.proposed[handle.offset..handle.offset + handle.len],
            drift: &mut self.drifts[handle.walker],
            moved: &mut self.moved[handle.walker],
            trial: &mut self.trials[handle.walker],
        }
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = ScratchSlot<'_>> + '_ {
        self.proposed
            .chunks_mut(self.n_particles)
            .zip(self.drifts.iter_mut())
            .zip(self.moved.iter_mut())
            .zip(self.trials.iter_mut())
            .map(|(((proposed, drift), moved), trial)| ScratchSlot {
                proposed,
                drift,
                moved,
                trial,
            })
    }

    pub fn par_slots_mut(&mut self) -> impl IndexedParallelIterator<Item = ScratchSlot<'_>> + '_ {
        self.proposed
            .par_chunks_mut(self.n_particles)
            .zip(self.drifts.par_iter_mut())
            .zip(self.moved.par_iter_mut())
            .zip(self.trials.par_iter_mut())
            .map(|(((proposed, drift), moved), trial)| ScratchSlot {
                proposed,
                drift,
                moved,
                trial,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_follow_resize() {
        let mut arena = ScratchArena::new(3);
        arena.resize(4);
        assert_eq!(arena.len(), 4);
        let h = arena.handle(2).unwrap();
        arena.slot_mut(h).proposed[1] = Vector3::new(1.0, 2.0, 3.0);
        assert!(arena.handle(4).is_none());

        arena.resize(8);
        let h = arena.handle(2).unwrap();
        assert_eq!(arena.slot_mut(h).proposed[1], Vector3::new(1.0, 2.0, 3.0));

        arena.resize(2);
        assert!(arena.handle(2).is_none());
        assert_eq!(arena.slots_mut().count(), 2);
    }

    #[test]
    fn test_parallel_slots_are_disjoint() {
        let mut arena = ScratchArena::new(2);
        arena.resize(16);
        arena.par_slots_mut().enumerate().for_each(|(i, slot)| {
            for p in slot.proposed.iter_mut() {
                *p = Vector3::repeat(i as f64);
            }
            *slot.moved = i % 2 == 0;
        });
        for (i, slot) in arena.slots_mut().enumerate() {
            assert!(slot.proposed.iter().all(|p| p.x == i as f64));
            assert_eq!(*slot.moved, i % 2 == 0);
        }
    }
}
