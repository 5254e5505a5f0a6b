//! Step executors: the same per-walker step, scheduled two ways.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{QmcError, Result};
use super::arena::ScratchArena;
use super::mover::{MoveCounters, MoveMode, MoveState, ParticleMover};
use super::traits::StepExecutor;
use super::walker::Walker;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Scalar,
    Batched,
}

/// Walker-major loop on the calling thread.
pub struct ScalarExecutor {
    arena: ScratchArena,
}

impl ScalarExecutor {
    pub fn new(n_particles: usize) -> Self {
        Self { arena: ScratchArena::new(n_particles) }
    }
}

impl StepExecutor for ScalarExecutor {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn advance(
        &mut self,
        mover: &ParticleMover<'_>,
        walkers: &mut [Walker],
    ) -> Result<MoveCounters> {
        self.arena.resize(walkers.len());
        let mut counters = MoveCounters::default();
        for (walker, mut slot) in walkers.iter_mut().zip(self.arena.slots_mut()) {
            counters += mover.advance_walker(walker, &mut slot)?;
        }
        Ok(counters)
    }
}

/// Particle-major lockstep: particle `i` is moved in every walker before particle `i + 1`,
/// with the walkers of each sweep spread over a rayon pool.
///
/// Each walker still sees its particles in order and draws from its own stream, so the result
/// is identical to `ScalarExecutor` for the same seeds.
pub struct BatchedExecutor {
    arena: ScratchArena,
    pool: Option<rayon::ThreadPool>,
}

impl BatchedExecutor {
    /// `threads = None` runs on the global rayon pool.
    pub fn new(n_particles: usize, threads: Option<usize>) -> Result<Self> {
        let pool = match threads {
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| QmcError::Config(format!("cannot build a {n}-thread pool: {e}")))?,
            ),
            None => None,
        };
        Ok(Self { arena: ScratchArena::new(n_particles), pool })
    }

    fn advance_lockstep(
        arena: &mut ScratchArena,
        mover: &ParticleMover<'_>,
        walkers: &mut [Walker],
    ) -> Result<MoveCounters> {
        let mut counters: MoveCounters = walkers
            .par_iter_mut()
            .zip(arena.par_slots_mut())
            .map(|(walker, slot)| {
                let mut c = MoveCounters::default();
                *slot.drift = mover.begin_step(walker, &mut c);
                *slot.moved = false;
                c
            })
            .sum();

        match mover.params().mode {
            MoveMode::ParticleByParticle => {
                let n_particles = walkers.first().map_or(0, |w| w.num_particles());
                for iat in 0..n_particles {
                    let sweep: Vec<MoveCounters> = walkers
                        .par_iter_mut()
                        .zip(arena.par_slots_mut())
                        .map(|(walker, slot)| -> Result<MoveCounters> {
                            let mut c = MoveCounters::default();
                            if mover.move_particle(walker, iat, *slot.drift, &mut c)?
                                == MoveState::Accepted
                            {
                                *slot.moved = true;
                            }
                            Ok(c)
                        })
                        .collect::<Result<_>>()?;
                    counters += sweep.into_iter().sum();
                }
            }
            MoveMode::AllElectron => {
                let sweep: Vec<MoveCounters> = walkers
                    .par_iter_mut()
                    .zip(arena.par_slots_mut())
                    .map(|(walker, mut slot)| -> Result<MoveCounters> {
                        let mut c = MoveCounters::default();
                        let drift = *slot.drift;
                        if mover.move_all(walker, &mut slot, drift, &mut c)?
                            == MoveState::Accepted
                        {
                            *slot.moved = true;
                        }
                        Ok(c)
                    })
                    .collect::<Result<_>>()?;
                counters += sweep.into_iter().sum();
            }
        }

        walkers
            .par_iter_mut()
            .zip(arena.par_slots_mut())
            .for_each(|(walker, slot)| mover.finish_step(walker, *slot.moved));
        Ok(counters)
    }
}

impl StepExecutor for BatchedExecutor {
    fn name(&self) -> &'static str {
        "batched"
    }

    fn advance(
        &mut self,
        mover: &ParticleMover<'_>,
        walkers: &mut [Walker],
    ) -> Result<MoveCounters> {
        self.arena.resize(walkers.len());
        let arena = &mut self.arena;
        match &self.pool {
            Some(pool) => pool.install(|| Self::advance_lockstep(arena, mover, walkers)),
            None => Self::advance_lockstep(arena, mover, walkers),
        }
    }

    fn max_over_walkers(
        &self,
        walkers: &mut [Walker],
        op: &(dyn Fn(&mut Walker) -> f64 + Sync),
    ) -> f64 {
        let mut run = move || walkers.into_par_iter().map(|w| op(w)).reduce(|| 0.0, f64::max);
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

pub fn build_executor(
    kind: ExecutorKind,
    n_particles: usize,
    threads: Option<usize>,
) -> Result<Box<dyn StepExecutor>> {
    Ok(match kind {
        ExecutorKind::Scalar => Box::new(ScalarExecutor::new(n_particles)),
        ExecutorKind::Batched => Box::new(BatchedExecutor::new(n_particles, threads)?),
    })
}
