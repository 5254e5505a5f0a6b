//! Rust DMC - walker propagation and population control for Quantum Monte Carlo.
//!
//! A population of walkers is moved with drift-diffusion proposals and a Metropolis test, the
//! trial wavefunction is updated incrementally per particle move, and in diffusion Monte Carlo
//! the walkers are branched or reconfigured to keep the weighted ensemble unbiased.

pub mod error;
pub mod wavefunction;
pub mod correlation;
pub mod systems;
pub mod sampling;
pub mod estimators;
pub mod io;

// Re-export commonly used types at crate root
pub use error::{QmcError, Result};
pub use wavefunction::{
    DeterminantUpdater, DiracDeterminant, SingleWfn, TrialState, TrialWaveFunction,
    WaveFunctionComponent,
};
pub use correlation::{ThreeBodyJastrow, TwoBodyJastrow};
pub use systems::{build_system, System, SystemConfig};
pub use sampling::{
    run_simulation, BranchingController, Communicator, EnergyCalculator, ParticleMover, QmcDriver,
    RunSummary, StepExecutor, Walker, WalkerPopulation,
};
pub use estimators::{BlockEstimator, EnergyStats, EstimatorSink};
pub use io::{load_config, RunConfig};
