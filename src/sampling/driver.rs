//! Block/step loop tying the executor, the branching controller and the estimator together.

use std::path::Path;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::error::{QmcError, Result};
use crate::estimators::{BlockEstimator, EnergyStats, EstimatorSink};
use crate::io::{
    load_snapshot, rank_path, save_snapshot, CheckpointConfig, Method, PopulationSnapshot,
    RunConfig,
};
use crate::systems::{build_system, System};
use super::balance::{balance_population, fair_share};
use super::branching::{BranchParams, BranchReport, BranchingController};
use super::comm::{collective, Communicator, LocalGroup, SingleProcess};
use super::executor::build_executor;
use super::mover::{MoveCounters, MoverParams, ParticleMover};
use super::traits::StepExecutor;
use super::walker::{Walker, WalkerPopulation};

/// What a finished run reports.
#[derive(Serialize, Clone, Debug)]
pub struct RunSummary {
    pub method: Method,
    pub system: String,
    pub energy: EnergyStats,
    pub exact_energy: Option<f64>,
    pub acceptance: f64,
    pub final_population: usize,
    pub e_trial: f64,
    pub blocks: usize,
    pub steps: usize,
    /// Time step at the end of the run; differs from the configured one only with `adapt_tau`.
    pub tau: f64,
}

/// Seed of one rank's master stream, well separated from its neighbours'.
fn rank_seed(seed: u64, rank: usize) -> u64 {
    seed ^ 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(rank as u64 + 1)
}

pub struct QmcDriver<'a> {
    config: RunConfig,
    system: &'a System,
    comm: &'a dyn Communicator,
    executor: Box<dyn StepExecutor>,
    controller: BranchingController,
    population: WalkerPopulation,
    rng: StdRng,
    tau: f64,
    step: usize,
    last_branch: Option<BranchReport>,
}

impl<'a> QmcDriver<'a> {
    pub fn new(config: &RunConfig, system: &'a System, comm: &'a dyn Communicator) -> Result<Self> {
        config.validate()?;
        let expected = &config.system;
        if expected.kind() != system.kind
            || expected.dims() != system.dims
            || expected.num_particles() != system.num_particles()
        {
            return Err(QmcError::Config(format!(
                "configuration describes a {} system with {} particles in {}d, \
                 got {} ({} particles in {}d)",
                expected.kind(),
                expected.num_particles(),
                expected.dims(),
                system.name,
                system.num_particles(),
                system.dims
            )));
        }
        let params = BranchParams {
            tau: config.tau,
            target_walkers: config.target(),
            min_walkers: config.min_population(),
            max_walkers: config.max_population(),
            max_copies: config.max_copies,
            reconfiguration: config.reconfiguration,
            feedback: config.feedback,
            max_age: config.max_age,
        };
        let mut rng = StdRng::seed_from_u64(rank_seed(config.seed, comm.rank()));
        let controller = BranchingController::new(params, 0.0, rng.gen());
        let executor = build_executor(config.executor, system.num_particles(), config.threads)?;
        Ok(Self {
            config: config.clone(),
            system,
            comm,
            executor,
            controller,
            population: WalkerPopulation::default(),
            rng,
            tau: config.tau,
            step: 0,
            last_branch: None,
        })
    }

    pub fn population(&self) -> &WalkerPopulation {
        &self.population
    }

    pub fn controller(&self) -> &BranchingController {
        &self.controller
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn last_branch(&self) -> Option<&BranchReport> {
        self.last_branch.as_ref()
    }

    /// Build the starting population, from the checkpoint when a restart is requested and
    /// the file is there, otherwise by scattering walkers around the system's centers.
    pub fn initialize(&mut self) -> Result<()> {
        let restart = self.config.checkpoint.as_ref().filter(|c| c.restart).map(|c| {
            rank_path(&c.path, self.comm.rank(), self.comm.size())
        });
        let found = restart.as_deref().is_some_and(Path::exists);
        let agreed = self.comm.all_gather_usize(usize::from(found));
        if agreed.iter().any(|&f| f != agreed[0]) {
            return Err(QmcError::Desync {
                what: "checkpoint availability",
                local: found as u8 as f64,
                global: agreed.iter().sum::<usize>() as f64,
            });
        }

        match (restart, found) {
            (Some(path), true) => {
                let outcome = load_snapshot(&path).and_then(|snapshot| self.restore(&snapshot));
                collective(self.comm, outcome, |n| {
                    QmcError::Checkpoint(format!("restart failed on {n} rank(s)"))
                })?;
                if self.comm.is_root() {
                    info!("restarted from {} at step {}", path.display(), self.step);
                }
            }
            (requested, _) => {
                if requested.is_some() && self.comm.is_root() {
                    warn!("no checkpoint to restart from; starting from random walkers");
                }
                let outcome = self.random_walkers();
                let walkers = collective(self.comm, outcome, |n| {
                    QmcError::Config(format!("walker initialization failed on {n} rank(s)"))
                })?;
                self.population = WalkerPopulation::new(walkers);
                let e0 = self.global_energy().unwrap_or(0.0);
                self.controller.restore_energies(e0, e0);
            }
        }
        Ok(())
    }

    fn random_walkers(&mut self) -> Result<Vec<Walker>> {
        let n = fair_share(self.config.walkers, self.comm.rank(), self.comm.size());
        let system = self.system;
        (0..n)
            .map(|_| {
                let positions = system.initial_positions(&mut self.rng);
                let mut walker = Walker::new(positions, &system.wavefunction, self.rng.gen());
                walker.initialize(&system.wavefunction, system.hamiltonian.as_ref())?;
                Ok(walker)
            })
            .collect()
    }

    /// Replace the population with the walkers of a snapshot.
    pub fn restore(&mut self, snapshot: &PopulationSnapshot) -> Result<()> {
        let walkers = snapshot.rebuild(self.system, &mut self.rng)?;
        self.population = WalkerPopulation::new(walkers);
        self.controller.restore_energies(snapshot.e_trial, snapshot.e_ref);
        self.step = snapshot.step;
        Ok(())
    }

    pub fn snapshot(&self) -> PopulationSnapshot {
        PopulationSnapshot::capture(
            self.step,
            self.controller.e_trial(),
            self.controller.e_ref(),
            self.population.walkers(),
        )
    }

    /// Σ w E_L / Σ w over every rank.
    fn global_energy(&self) -> Option<f64> {
        let walkers = self.population.walkers();
        let we = walkers.iter().map(|w| w.weight * w.local_energy).sum::<f64>();
        let w = walkers.iter().map(|w| w.weight).sum::<f64>();
        let we: f64 = self.comm.all_gather_f64(we).iter().sum();
        let w: f64 = self.comm.all_gather_f64(w).iter().sum();
        (w > 0.0).then(|| we / w)
    }

    fn global_count(&self, value: usize) -> usize {
        self.comm.all_gather_usize(value).iter().sum()
    }

    /// One step of every local walker, followed by the weight update in DMC.
    fn advance(&mut self) -> Result<MoveCounters> {
        let system = self.system;
        let params = MoverParams {
            tau: self.tau,
            drift: self.config.drift,
            mode: self.config.move_mode,
            fixed_node: self.config.is_dmc(),
            max_age: self.config.max_age,
        };
        let mover = ParticleMover::new(&system.wavefunction, system.hamiltonian.as_ref(), params);
        let counters = self.executor.advance(&mover, self.population.walkers_mut())?;
        if self.config.is_dmc() {
            self.controller.update_weights(self.population.walkers_mut());
        }
        self.step += 1;
        let period = self.config.recompute_period;
        if period > 0 && self.step % period == 0 {
            self.recompute_all();
        }
        Ok(counters)
    }

    /// Rebuild every walker's caches from its positions to wipe out accumulated round-off.
    /// A walker whose matrices turn out singular keeps its incremental caches.
    fn recompute_all(&mut self) {
        let system = self.system;
        let wf = &system.wavefunction;
        let step = self.step;
        let refresh = |walker: &mut Walker| -> f64 {
            let saved = walker.trial.clone();
            match wf.recompute(&mut walker.trial, &walker.positions) {
                Ok(drift) => drift.abs(),
                Err(err) => {
                    warn!("step {step}: full recompute failed ({err}); keeping incremental caches");
                    walker.trial = saved;
                    0.0
                }
            }
        };
        let max_drift = self.executor.max_over_walkers(self.population.walkers_mut(), &refresh);
        debug!("step {step}: recomputed caches, max |Δ ln Ψ| = {max_drift:.3e}");
    }

    fn branch_due(&self) -> bool {
        self.config.is_dmc() && self.step % self.config.branch_interval == 0
    }

    /// Population control followed by load balancing across ranks.
    fn branch(&mut self) -> Result<()> {
        let mut report = self.controller.branch(&mut self.population, self.step, self.comm)?;
        balance_population(&mut self.population, self.comm, self.system, &mut self.rng)?;
        report.local_after = self.population.len();
        self.last_branch = Some(report);
        Ok(())
    }

    /// Square-root rule toward the target acceptance, kept within a decade of the initial τ.
    fn adapt_tau(&mut self, acceptance: f64) {
        let adjustment = (acceptance / self.config.target_acceptance).sqrt();
        self.tau = (self.tau * adjustment).clamp(self.config.tau / 10.0, self.config.tau * 10.0);
    }

    fn write_checkpoint(&self, checkpoint: &CheckpointConfig) -> Result<()> {
        let path = rank_path(&checkpoint.path, self.comm.rank(), self.comm.size());
        let outcome = save_snapshot(&path, &self.snapshot());
        collective(self.comm, outcome, |n| {
            QmcError::Checkpoint(format!("writing failed on {n} rank(s)"))
        })?;
        if self.comm.is_root() {
            info!("checkpoint written to {} at step {}", checkpoint.path.display(), self.step);
        }
        Ok(())
    }

    /// Warm up, then run `blocks × steps` steps feeding `estimator`. Call `initialize` first.
    pub fn run(&mut self, estimator: &mut BlockEstimator) -> Result<RunSummary> {
        let root = self.comm.is_root();
        let dmc = self.config.is_dmc();
        let start = self.global_count(self.population.len());
        if root {
            info!(
                "{:?} on {}: tau = {}, {} walkers over {} rank(s), {} executor, {}",
                self.config.method,
                self.system.name,
                self.tau,
                start,
                self.comm.size(),
                self.executor.name(),
                if self.config.reconfiguration {
                    "reconfiguration"
                } else {
                    "fluctuating population"
                },
            );
        }

        for _ in 0..self.config.warmup_steps {
            self.advance()?;
            if self.branch_due() {
                self.branch()?;
            }
        }
        if dmc && self.config.warmup_steps > 0 {
            if let Some(e) = self.global_energy() {
                self.controller.set_reference(e);
            }
        }

        let mut total = MoveCounters::default();
        for block in 0..self.config.blocks {
            estimator.start_block();
            let mut counters = MoveCounters::default();
            for _ in 0..self.config.steps {
                counters += self.advance()?;
                estimator.accumulate(self.population.walkers());
                if self.branch_due() {
                    self.branch()?;
                }
            }
            debug!(
                "rank {} block {block}: {} singular, {} nodal rejections, \
                 {} stuck walkers refreshed",
                self.comm.rank(),
                counters.singular,
                counters.nodal,
                counters.refreshed
            );
            estimator.stop_block(counters.acceptance());
            estimator.reduce_block(self.comm);
            total += counters;

            if let Some(record) = estimator.last_block() {
                if dmc {
                    self.controller.set_reference(record.energy());
                } else if self.config.adapt_tau {
                    self.adapt_tau(record.acceptance);
                }
                if root {
                    info!(
                        "block {block}: E = {:.6}, var = {:.4}, pop = {:.1}, \
                         acc = {:.3}, E_T = {:.6}",
                        record.energy(),
                        record.variance(),
                        record.population(),
                        record.acceptance,
                        self.controller.e_trial()
                    );
                }
            }
            if let Some(ckpt) = &self.config.checkpoint {
                if ckpt.period > 0 && (block + 1) % ckpt.period == 0 {
                    self.write_checkpoint(ckpt)?;
                }
            }
        }
        if let Some(ckpt) = &self.config.checkpoint {
            if ckpt.period == 0 || self.config.blocks % ckpt.period != 0 {
                self.write_checkpoint(ckpt)?;
            }
        }

        let accepted = self.comm.all_gather_usize(total.accepted).iter().sum::<usize>();
        let proposals = self.comm.all_gather_usize(total.proposals()).iter().sum::<usize>();
        Ok(RunSummary {
            method: self.config.method,
            system: self.system.name.clone(),
            energy: estimator.stats(),
            exact_energy: self.system.exact_energy,
            acceptance: if proposals > 0 { accepted as f64 / proposals as f64 } else { 0.0 },
            final_population: self.global_count(self.population.len()),
            e_trial: self.controller.e_trial(),
            blocks: self.config.blocks,
            steps: self.config.steps,
            tau: self.tau,
        })
    }
}

fn run_rank(config: &RunConfig, system: &System, comm: &dyn Communicator) -> Result<RunSummary> {
    let mut driver = QmcDriver::new(config, system, comm)?;
    driver.initialize()?;
    let mut estimator = BlockEstimator::new(config.discard_blocks);
    driver.run(&mut estimator)
}

/// Build the configured system and run it on `config.ranks` in-process ranks.
///
/// Every rank computes the same reduced statistics; rank 0's summary is returned.
pub fn run_simulation(config: &RunConfig) -> Result<RunSummary> {
    config.validate()?;
    let system = build_system(&config.system, config.singular_floor)?;
    if config.ranks == 1 {
        return run_rank(config, &system, &SingleProcess);
    }
    let groups = LocalGroup::create(config.ranks);
    let system = &system;
    let results: Vec<Result<RunSummary>> = std::thread::scope(|scope| {
        let handles: Vec<_> = groups
            .iter()
            .map(|comm| scope.spawn(move || run_rank(config, system, comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });
    let mut summaries = results.into_iter().collect::<Result<Vec<_>>>()?;
    Ok(summaries.swap_remove(0))
}
