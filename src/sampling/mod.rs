//! Sampling module - walker propagation, population control and the run loop.

mod arena;
mod balance;
mod branching;
mod comm;
mod driver;
mod executor;
mod mover;
mod traits;
mod walker;

pub use arena::{ArenaHandle, ScratchArena, ScratchSlot};
pub use balance::{balance_population, fair_share, transfer_plan, Transfer};
pub use branching::{
    apportion, comb_copies, BranchParams, BranchReport, BranchingController, FeedbackLaw,
};
pub use comm::{check_agreement, collective, Communicator, LocalGroup, SingleProcess};
pub use driver::{run_simulation, QmcDriver, RunSummary};
pub use executor::{build_executor, BatchedExecutor, ExecutorKind, ScalarExecutor};
pub use mover::{
    acceptance_probability, log_transition, DriftPolicy, MoveCounters, MoveMode, MoveState,
    MoverParams,
    ParticleMover, ProposedMove,
};
pub use traits::{BranchingResult, EnergyCalculator, StepExecutor};
pub use walker::{Walker, WalkerPopulation};
