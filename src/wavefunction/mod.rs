//! Wavefunction module - orbitals, determinants and the composite trial function.

mod traits;
mod slater;
mod determinant;
mod trial;

pub use traits::{OrbitalBox, SingleWfn};
pub use slater::{GaussianOrbital, Slater1s};
pub use determinant::{DeterminantState, DeterminantUpdater, DiracDeterminant};
pub use trial::{ComponentState, MoveRatio, TrialState, TrialWaveFunction, WaveFunctionComponent};
