//! Population control.
//!
//! Each step multiplies a walker's weight by the short-time branch factor
//!
//! ```text
//! ζ = exp(-τ (½(E_L,old + E_L,new) - E_T))
//! ```
//!
//! and every `branch_interval` steps the accumulated weights are turned into integer copy
//! numbers, either independently per walker (fluctuating population) or with a single comb laid
//! over the global cumulative weight (fixed population). Both keep the expected number of copies
//! of walker i proportional to its weight, which is what leaves weighted averages unbiased.

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{QmcError, Result};
use super::comm::{check_agreement, Communicator};
use super::traits::BranchingResult;
use super::walker::{Walker, WalkerPopulation};

/// How E_T reacts to the population drifting away from its target.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "law", rename_all = "lowercase")]
pub enum FeedbackLaw {
    /// E_T = E_ref - gain ln(N / N_target)
    Logarithmic { gain: f64 },
    /// E_T ← E_T + gain (1 - N / N_target) / τ
    Linear { gain: f64 },
}

impl Default for FeedbackLaw {
    fn default() -> Self {
        FeedbackLaw::Logarithmic { gain: 1.0 }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BranchParams {
    pub tau: f64,
    /// Global population target; the exact population in reconfiguration mode.
    pub target_walkers: usize,
    pub min_walkers: usize,
    pub max_walkers: usize,
    pub max_copies: usize,
    pub reconfiguration: bool,
    pub feedback: FeedbackLaw,
    /// Walkers older than this cannot gain weight.
    pub max_age: usize,
}

/// What one branching pass did.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct BranchReport {
    pub step: usize,
    pub local_before: usize,
    pub local_after: usize,
    pub global_before: usize,
    pub global_after: usize,
    pub total_weight: f64,
    pub killed: usize,
    pub copied: usize,
    pub e_trial: f64,
}

/// Copies assigned to each walker by comb teeth at `k + u` for k in 0..n, in coordinates where
/// the walkers occupy `[start, end)` consecutively with widths `weight * scale`.
pub fn comb_copies(
    weights: &[f64],
    start: f64,
    end: f64,
    scale: f64,
    u: f64,
    n: usize,
) -> Vec<usize> {
    let teeth_below = |x: f64| -> usize { ((x - u).ceil().max(0.0) as usize).min(n) };
    let mut copies = Vec::with_capacity(weights.len());
    let mut lo = start.min(end);
    let mut prev = teeth_below(lo);
    for (i, w) in weights.iter().enumerate() {
        let hi = if i + 1 == weights.len() { end } else { (lo + w * scale).min(end) };
        let next = teeth_below(hi);
        copies.push(next - prev);
        prev = next;
        lo = hi;
    }
    copies
}

/// Split `amount` over ranks in proportion to `counts` by largest remainder. Every rank computes
/// the same split from the same gathered counts. While `amount` is below the total count no rank
/// is assigned more than it holds.
pub fn apportion(amount: usize, counts: &[usize]) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return vec![0; counts.len()];
    }
    let mut shares: Vec<usize> = counts.iter().map(|&c| amount * c / total).collect();
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by_key(|&r| (std::cmp::Reverse(amount * counts[r] % total), r));
    let left = amount - shares.iter().sum::<usize>();
    for &r in order.iter().take(left) {
        shares[r] += 1;
    }
    shares
}

fn sanitize(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

pub struct BranchingController {
    params: BranchParams,
    e_trial: f64,
    e_ref: f64,
    rng: StdRng,
}

impl BranchingController {
    pub fn new(params: BranchParams, e_ref: f64, seed: u64) -> Self {
        Self { params, e_trial: e_ref, e_ref, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn params(&self) -> &BranchParams {
        &self.params
    }

    pub fn e_trial(&self) -> f64 {
        self.e_trial
    }

    pub fn e_ref(&self) -> f64 {
        self.e_ref
    }

    /// Reference energy for the logarithmic law, normally the last block's mean energy.
    pub fn set_reference(&mut self, e_ref: f64) {
        if e_ref.is_finite() {
            self.e_ref = e_ref;
        }
    }

    /// Resume from a checkpoint.
    pub fn restore_energies(&mut self, e_trial: f64, e_ref: f64) {
        self.e_trial = e_trial;
        self.e_ref = e_ref;
    }

    /// Single-step branch factor for a walker that has just moved.
    pub fn branch_factor(&self, walker: &Walker) -> f64 {
        let e_mean = 0.5 * (walker.old_local_energy + walker.local_energy);
        let g = (-self.params.tau * (e_mean - self.e_trial)).exp();
        if walker.is_stuck(self.params.max_age) {
            g.min(1.0)
        } else {
            g
        }
    }

    /// Fold this step's branch factor into each walker's weight.
    pub fn update_weights(&self, walkers: &mut [Walker]) {
        for walker in walkers.iter_mut() {
            walker.weight = sanitize(walker.weight * self.branch_factor(walker));
            walker.multiplicity = walker.weight;
        }
    }

    fn update_trial_energy(&mut self, global: usize) {
        let ratio = global as f64 / self.params.target_walkers.max(1) as f64;
        match self.params.feedback {
            FeedbackLaw::Logarithmic { gain } => {
                self.e_trial = self.e_ref - gain * ratio.ln();
            }
            FeedbackLaw::Linear { gain } => {
                self.e_trial += gain * (1.0 - ratio) / self.params.tau;
            }
        }
    }

    fn spawn(&mut self, parent: &Walker) -> Walker {
        let seed = self.rng.gen::<u64>();
        parent.branch_copy(seed)
    }

    /// Turn the accumulated weights into a new generation and reset every weight to one.
    pub fn branch(
        &mut self,
        population: &mut WalkerPopulation,
        step: usize,
        comm: &dyn Communicator,
    ) -> Result<BranchReport> {
        check_agreement(comm, "branching step", step as f64)?;
        check_agreement(comm, "trial energy", self.e_trial)?;
        let mut report = if self.params.reconfiguration {
            self.reconfigure(population, step, comm)?
        } else {
            self.stochastic(population, step, comm)?
        };
        population.reset_weights();
        self.update_trial_energy(report.global_after);
        report.e_trial = self.e_trial;
        debug!(
            "step {step}: branched {} -> {} walkers (killed {}, copied {}), E_T = {:.6}",
            report.global_before, report.global_after, report.killed, report.copied, self.e_trial
        );
        Ok(report)
    }

    fn stochastic(
        &mut self,
        population: &mut WalkerPopulation,
        step: usize,
        comm: &dyn Communicator,
    ) -> Result<BranchReport> {
        let local_before = population.len();
        let counts = comm.all_gather_usize(local_before);
        let weights = comm.all_gather_f64(population.total_weight());

        let mut report = BranchReport {
            step,
            local_before,
            global_before: counts.iter().sum(),
            total_weight: weights.iter().sum(),
            ..Default::default()
        };

        let parents = population.take();
        let mut next = Vec::with_capacity(parents.len());
        for mut walker in parents {
            let zeta = walker.weight;
            let u: f64 = walker.rng.gen();
            // Float-to-int casts saturate, so an infinite weight lands on `max_copies`.
            let copies = ((zeta + u).floor() as usize).min(self.params.max_copies);
            match BranchingResult::from_copies(copies) {
                BranchingResult::Kill => report.killed += 1,
                BranchingResult::Keep => next.push(walker),
                BranchingResult::Clone { n } => {
                    for _ in 1..n {
                        let child = self.spawn(&walker);
                        next.push(child);
                        report.copied += 1;
                    }
                    next.push(walker);
                }
            }
        }
        population.replace(next);

        let counts = comm.all_gather_usize(population.len());
        if counts.iter().sum::<usize>() == 0 {
            return Err(QmcError::PopulationCollapse { step });
        }
        self.enforce_bounds(population, &counts, comm);

        report.local_after = population.len();
        report.global_after = comm.all_gather_usize(population.len()).iter().sum();
        if report.global_after == 1 {
            warn!("step {step}: population is down to a single walker");
        }
        Ok(report)
    }

    /// Bring the global population back inside `[min_walkers, max_walkers]`. Only the global
    /// excess or deficit is removed or duplicated, spread over ranks in proportion to their
    /// counts; a rank holding more than an even share is left alone while the total is in bounds.
    fn enforce_bounds(
        &mut self,
        population: &mut WalkerPopulation,
        counts: &[usize],
        comm: &dyn Communicator,
    ) {
        let global: usize = counts.iter().sum();
        let rank = comm.rank();
        let max = self.params.max_walkers.max(1);
        if global > max {
            if comm.is_root() {
                warn!("population {global} above bound {max}; removing {} walkers", global - max);
            }
            let remove = apportion(global - max, counts)[rank];
            let mut walkers = population.take();
            for _ in 0..remove {
                let i = self.rng.gen_range(0..walkers.len());
                walkers.swap_remove(i);
            }
            population.replace(walkers);
        } else if global < self.params.min_walkers {
            if comm.is_root() {
                warn!(
                    "population {global} below bound {}; duplicating {} walkers",
                    self.params.min_walkers,
                    self.params.min_walkers - global
                );
            }
            let add = apportion(self.params.min_walkers - global, counts)[rank];
            let local = population.len();
            let mut walkers = population.take();
            for _ in 0..add {
                let i = self.rng.gen_range(0..local);
                let child = self.spawn(&walkers[i]);
                walkers.push(child);
            }
            population.replace(walkers);
        }
    }

    fn reconfigure(
        &mut self,
        population: &mut WalkerPopulation,
        step: usize,
        comm: &dyn Communicator,
    ) -> Result<BranchReport> {
        let rank = comm.rank();
        let local_before = population.len();
        let counts = comm.all_gather_usize(local_before);
        let global_before: usize = counts.iter().sum();
        if global_before == 0 {
            return Err(QmcError::PopulationCollapse { step });
        }

        let mut weights: Vec<f64> =
            population.walkers().iter().map(|w| sanitize(w.weight)).collect();
        let local_sum: f64 = weights.iter().sum();
        let mut sums = comm.all_gather_f64(local_sum);
        let mut total: f64 = sums.iter().sum();
        if !(total > 0.0 && total.is_finite()) {
            // Every rank sees the same gathered sums, so every rank takes this branch.
            warn!("step {step}: total weight {total} is degenerate; resampling uniformly");
            weights.iter_mut().for_each(|w| *w = 1.0);
            sums = counts.iter().map(|&c| c as f64).collect();
            total = global_before as f64;
        }

        let target = self.params.target_walkers;
        let draw = if comm.is_root() { self.rng.gen::<f64>() } else { 0.0 };
        let u = comm.broadcast_f64(draw, 0);
        check_agreement(comm, "comb offset", u)?;

        let scale = target as f64 / total;
        let prefix: f64 = sums[..rank].iter().sum();
        let start = prefix * scale;
        let end = if rank + 1 == comm.size() {
            target as f64
        } else {
            (prefix + sums[rank]) * scale
        };
        let copies = comb_copies(&weights, start, end, scale, u, target);

        let mut report = BranchReport {
            step,
            local_before,
            global_before,
            total_weight: total,
            ..Default::default()
        };
        let parents = population.take();
        let mut next = Vec::with_capacity(copies.iter().sum());
        for (walker, &n) in parents.into_iter().zip(&copies) {
            if n == 0 {
                report.killed += 1;
                continue;
            }
            for _ in 1..n {
                let child = self.spawn(&walker);
                next.push(child);
                report.copied += 1;
            }
            next.push(walker);
        }
        population.replace(next);

        report.local_after = population.len();
        report.global_after = comm.all_gather_usize(report.local_after).iter().sum();
        if report.global_after != target {
            return Err(QmcError::Desync {
                what: "reconfigured population",
                local: report.global_after as f64,
                global: target as f64,
            });
        }
        if report.global_after == 0 {
            return Err(QmcError::PopulationCollapse { step });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use crate::sampling::comm::SingleProcess;
    use crate::wavefunction::{
        DiracDeterminant, GaussianOrbital, TrialWaveFunction, WaveFunctionComponent,
    };

    fn params(reconfiguration: bool) -> BranchParams {
        BranchParams {
            tau: 0.01,
            target_walkers: 64,
            min_walkers: 8,
            max_walkers: 256,
            max_copies: 3,
            reconfiguration,
            feedback: FeedbackLaw::default(),
            max_age: 2,
        }
    }

    fn population(weights: &[f64]) -> WalkerPopulation {
        let wf = TrialWaveFunction::new(
            vec![WaveFunctionComponent::Determinant(DiracDeterminant::new(
                vec![Box::new(GaussianOrbital::new(1.0, Vector3::zeros(), 1))],
                0,
                1e-12,
            ))],
            1,
        );
        WalkerPopulation::new(
            weights
                .iter()
                .enumerate()
                .map(|(i, &w)| {
                    let mut walker =
                        Walker::new(vec![Vector3::new(i as f64, 0.0, 0.0)], &wf, i as u64);
                    walker.weight = w;
                    walker.local_energy = i as f64;
                    walker
                })
                .collect(),
        )
    }

    #[test]
    fn test_comb_is_population_exact() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let weights: Vec<f64> = (0..37).map(|_| rng.gen_range(0.0..3.0)).collect();
            let total: f64 = weights.iter().sum();
            let n = 50;
            let u: f64 = rng.gen();
            let copies = comb_copies(&weights, 0.0, n as f64, n as f64 / total, u, n);
            assert_eq!(copies.iter().sum::<usize>(), n);
        }
    }

    #[test]
    fn test_comb_split_over_segments_is_exact() {
        // The same comb evaluated over three consecutive segments, as three ranks would.
        let weights = [0.3, 1.7, 0.0, 2.2, 0.9, 1.1, 0.4];
        let parts = [&weights[..2], &weights[2..5], &weights[5..]];
        let sums: Vec<f64> = parts.iter().map(|p| p.iter().sum()).collect();
        let total: f64 = sums.iter().sum();
        let n = 11;
        let scale = n as f64 / total;
        for &u in &[0.0, 0.13, 0.77, 0.999] {
            let mut all = Vec::new();
            let mut prefix = 0.0;
            for (r, part) in parts.iter().enumerate() {
                let start = prefix * scale;
                let end = if r + 1 == parts.len() { n as f64 } else { (prefix + sums[r]) * scale };
                all.extend(comb_copies(part, start, end, scale, u, n));
                prefix += sums[r];
            }
            assert_eq!(all.iter().sum::<usize>(), n);
            assert_eq!(all[2], 0);
        }
    }

    #[test]
    fn test_reconfiguration_keeps_target_exactly() {
        let mut controller = BranchingController::new(params(true), 0.0, 5);
        let mut rng = StdRng::seed_from_u64(99);
        let mut pop = population(&vec![1.0; 64]);
        for step in 0..50 {
            for w in pop.walkers_mut() {
                w.weight = rng.gen_range(0.0..2.0);
            }
            let report = controller.branch(&mut pop, step, &SingleProcess).unwrap();
            assert_eq!(pop.len(), 64);
            assert_eq!(report.global_after, 64);
            assert_eq!(report.copied, report.killed);
            assert!(pop.walkers().iter().all(|w| w.weight == 1.0));
        }
    }

    #[test]
    fn test_zero_weights_resample_uniformly() {
        let mut controller = BranchingController::new(params(true), 0.0, 5);
        let mut pop = population(&vec![0.0; 64]);
        let report = controller.branch(&mut pop, 0, &SingleProcess).unwrap();
        assert_eq!(report.global_after, 64);
        assert_eq!(report.killed, 0);
    }

    #[test]
    fn test_stochastic_collapse_is_fatal() {
        let mut controller = BranchingController::new(params(false), 0.0, 5);
        let mut pop = population(&[0.0, 0.0, 0.0]);
        let err = controller.branch(&mut pop, 7, &SingleProcess).unwrap_err();
        assert!(matches!(err, QmcError::PopulationCollapse { step: 7 }));
    }

    #[test]
    fn test_stochastic_copies_follow_weights() {
        let mut p = params(false);
        p.min_walkers = 0;
        let mut controller = BranchingController::new(p, 0.0, 5);
        let mut total = 0usize;
        let trials = 2000;
        for trial in 0..trials {
            let mut pop = population(&[1.4, 0.3, 2.5]);
            for (i, w) in pop.walkers_mut().iter_mut().enumerate() {
                w.rng = StdRng::seed_from_u64((trial * 3 + i) as u64);
            }
            controller.branch(&mut pop, trial, &SingleProcess).unwrap();
            total += pop.len();
        }
        // E[copies] = 1.4 + 0.3 + 2.5, none above max_copies = 3
        assert_relative_eq!(total as f64 / trials as f64, 4.2, epsilon = 0.08);
    }

    #[test]
    fn test_bounds_are_enforced() {
        let mut p = params(false);
        p.max_walkers = 10;
        p.min_walkers = 6;
        let mut controller = BranchingController::new(p, 0.0, 5);
        let mut pop = population(&vec![3.0; 8]);
        controller.branch(&mut pop, 0, &SingleProcess).unwrap();
        assert_eq!(pop.len(), 10);

        let mut pop = population(&[1.0, 1.0, 0.0, 0.0]);
        controller.branch(&mut pop, 1, &SingleProcess).unwrap();
        assert_eq!(pop.len(), 6);
    }

    #[test]
    fn test_apportion_is_exact_and_proportional() {
        assert_eq!(apportion(4, &[15, 1]), vec![4, 0]);
        assert_eq!(apportion(20, &[30, 10]), vec![15, 5]);
        assert_eq!(apportion(3, &[1, 1, 1, 0]), vec![1, 1, 1, 0]);
        assert_eq!(apportion(5, &[0, 0]), vec![0, 0]);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let counts: Vec<usize> = (0..5).map(|_| rng.gen_range(0..40)).collect();
            let total: usize = counts.iter().sum();
            if total == 0 {
                continue;
            }
            let amount = rng.gen_range(0..total);
            let shares = apportion(amount, &counts);
            assert_eq!(shares.iter().sum::<usize>(), amount);
            assert!(shares.iter().zip(&counts).all(|(s, c)| s <= c));
        }
    }

    #[test]
    fn test_feedback_laws() {
        let mut p = params(false);
        p.feedback = FeedbackLaw::Logarithmic { gain: 0.5 };
        let mut log_law = BranchingController::new(p, -1.0, 0);
        log_law.update_trial_energy(128);
        assert_relative_eq!(log_law.e_trial(), -1.0 - 0.5 * 2.0f64.ln(), epsilon = 1e-14);
        log_law.update_trial_energy(64);
        assert_relative_eq!(log_law.e_trial(), -1.0, epsilon = 1e-14);

        p.feedback = FeedbackLaw::Linear { gain: 1.0 };
        let mut linear = BranchingController::new(p, -1.0, 0);
        linear.update_trial_energy(32);
        assert_relative_eq!(linear.e_trial(), -1.0 + 0.5 / 0.01, epsilon = 1e-10);
    }

    #[test]
    fn test_stuck_walker_cannot_gain_weight() {
        let controller = BranchingController::new(params(false), 0.0, 0);
        let mut pop = population(&[1.0]);
        let walker = &mut pop.walkers_mut()[0];
        walker.local_energy = -10.0;
        walker.old_local_energy = -10.0;
        assert!(controller.branch_factor(walker) > 1.0);
        walker.age = 3;
        assert_eq!(controller.branch_factor(walker), 1.0);
    }
}
