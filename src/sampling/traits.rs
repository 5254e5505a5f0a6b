//! Traits for Monte Carlo sampling.

use nalgebra::Vector3;

use crate::error::Result;
use super::mover::{MoveCounters, ParticleMover};
use super::walker::Walker;

/// Hamiltonian seen by the walker engine.
///
/// Only the potential has to be supplied; the kinetic part follows from the cached
/// G = ∇ ln Ψ and L = ∇² ln Ψ the walker already carries.
pub trait EnergyCalculator: Send + Sync {
    fn potential(&self, positions: &[Vector3<f64>]) -> f64;

    /// E_L = -½ Σᵢ (Lᵢ + |Gᵢ|²) + V
    fn local_energy(&self, walker: &Walker) -> f64 {
        walker.kinetic_energy() + self.potential(&walker.positions)
    }
}

/// Branching decision for one walker (DMC).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchingResult {
    Clone { n: usize }, // n is the total number of copies, parent included
    Keep,               // The walker continues as is
    Kill,               // The walker should be removed
}

impl BranchingResult {
    pub fn from_copies(copies: usize) -> Self {
        match copies {
            0 => BranchingResult::Kill,
            1 => BranchingResult::Keep,
            n => BranchingResult::Clone { n },
        }
    }

    pub fn copies(&self) -> usize {
        match self {
            BranchingResult::Kill => 0,
            BranchingResult::Keep => 1,
            BranchingResult::Clone { n } => *n,
        }
    }
}

/// Advances every walker of the local population by one Monte Carlo step.
///
/// Implementations differ in how they schedule the work (walker-major loop, particle-major
/// lockstep across threads) but must produce the same per-walker result for the same RNG streams.
pub trait StepExecutor: Send {
    fn name(&self) -> &'static str;

    fn advance(
        &mut self,
        mover: &ParticleMover<'_>,
        walkers: &mut [Walker],
    ) -> Result<MoveCounters>;

    /// Apply `op` to every walker on the threads this executor steps walkers on, returning the
    /// largest value produced (0 when there are no walkers).
    fn max_over_walkers(
        &self,
        walkers: &mut [Walker],
        op: &(dyn Fn(&mut Walker) -> f64 + Sync),
    ) -> f64 {
        walkers.iter_mut().map(|w| op(w)).fold(0.0, f64::max)
    }
}
