//! Metropolis moves with drift-diffusion proposals.
//!
//! A proposal is r' = r + D(G(r)) + χ with χ ~ N(0, τ) and D the drift policy applied to
//! G = ∇ ln Ψ. It is accepted with probability
//!
//! ```text
//! min(1, |Ψ(r')/Ψ(r)|² · G(r' → r) / G(r → r'))
//! ```
//!
//! where G(a → b) = exp(-|b - a - D(G(a))|² / 2τ). With the drift switched off the two Green's
//! functions cancel and this is plain Metropolis sampling of |Ψ|².
//!
//! Reference: C. J. Umrigar, M. P. Nightingale, K. J. Runge, J. Chem. Phys. 99, 2865 (1993).

use std::ops::{Add, AddAssign};

use log::trace;
use nalgebra::Vector3;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{QmcError, Result};
use crate::wavefunction::TrialWaveFunction;
use super::arena::ScratchSlot;
use super::traits::EnergyCalculator;
use super::walker::Walker;

/// How ∇ ln Ψ is turned into a deterministic displacement.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriftPolicy {
    /// Pure diffusion.
    None,
    /// τ G
    Plain,
    /// τ_eff G with τ_eff = (√(1 + 2aτ|G|²) - 1) / (a|G|²), which tends to τ for small |G|
    /// and keeps |drift| under √(2τ/a) near nodes.
    Umrigar { a: f64 },
    /// τ G rescaled to length at most `max`.
    Capped { max: f64 },
}

impl Default for DriftPolicy {
    fn default() -> Self {
        DriftPolicy::Umrigar { a: 1.0 }
    }
}

impl DriftPolicy {
    pub fn drift(&self, tau: f64, grad: &Vector3<f64>) -> Vector3<f64> {
        let v2 = grad.norm_squared();
        if !v2.is_finite() {
            return Vector3::zeros();
        }
        match *self {
            DriftPolicy::None => Vector3::zeros(),
            DriftPolicy::Plain => grad * tau,
            DriftPolicy::Umrigar { a } => {
                let x = a * tau * v2;
                if x < 1e-12 {
                    grad * tau
                } else {
                    grad * (((1.0 + 2.0 * x).sqrt() - 1.0) / (a * v2))
                }
            }
            DriftPolicy::Capped { max } => {
                let d = grad * tau;
                let len = d.norm();
                if len > max {
                    d * (max / len)
                } else {
                    d
                }
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MoveMode {
    /// Sequential single-particle moves, each accepted or rejected on its own.
    #[default]
    #[serde(rename = "particle")]
    ParticleByParticle,
    /// All particles displaced at once and judged together.
    #[serde(rename = "all")]
    AllElectron,
}

/// Lifecycle of one proposal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveState {
    Idle,
    Proposed,
    Accepted,
    Rejected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveCounters {
    pub accepted: usize,
    pub rejected: usize,
    /// Rejections forced by a determinant ratio under the singular floor.
    pub singular: usize,
    /// Rejections forced by a node crossing under the fixed-node constraint.
    pub nodal: usize,
    /// Stuck walkers stepped with pure diffusion.
    pub refreshed: usize,
}

impl MoveCounters {
    pub fn proposals(&self) -> usize {
        self.accepted + self.rejected
    }

    pub fn acceptance(&self) -> f64 {
        if self.proposals() == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposals() as f64
        }
    }
}

impl AddAssign for MoveCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.accepted += rhs.accepted;
        self.rejected += rhs.rejected;
        self.singular += rhs.singular;
        self.nodal += rhs.nodal;
        self.refreshed += rhs.refreshed;
    }
}

impl Add for MoveCounters {
    type Output = MoveCounters;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl std::iter::Sum for MoveCounters {
    fn sum<I: Iterator<Item = MoveCounters>>(iter: I) -> Self {
        iter.fold(MoveCounters::default(), Add::add)
    }
}

/// ln G(from → to) up to the normalization, which cancels in the acceptance ratio.
#[inline]
pub fn log_transition(
    tau: f64,
    from: &Vector3<f64>,
    to: &Vector3<f64>,
    drift_at_from: &Vector3<f64>,
) -> f64 {
    -(to - from - drift_at_from).norm_squared() / (2.0 * tau)
}

/// min(1, ratio² exp(ln G_b - ln G_f)); zero for non-finite input.
#[inline]
pub fn acceptance_probability(ratio: f64, log_gf: f64, log_gb: f64) -> f64 {
    let p = ratio * ratio * (log_gb - log_gf).exp();
    if p.is_nan() {
        0.0
    } else {
        p.min(1.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MoverParams {
    pub tau: f64,
    pub drift: DriftPolicy,
    pub mode: MoveMode,
    /// Reject any move that changes the sign of Ψ.
    pub fixed_node: bool,
    /// Walkers older than this get a pure-diffusion step.
    pub max_age: usize,
}

/// A proposed single-particle move between `propose` and `decide`.
#[derive(Clone, Copy, Debug)]
pub struct ProposedMove {
    pub iat: usize,
    pub old_pos: Vector3<f64>,
    pub new_pos: Vector3<f64>,
    pub log_gf: f64,
    pub state: MoveState,
}

pub struct ParticleMover<'a> {
    wavefunction: &'a TrialWaveFunction,
    hamiltonian: &'a dyn EnergyCalculator,
    params: MoverParams,
}

impl<'a> ParticleMover<'a> {
    pub fn new(
        wavefunction: &'a TrialWaveFunction,
        hamiltonian: &'a dyn EnergyCalculator,
        params: MoverParams,
    ) -> Self {
        Self { wavefunction, hamiltonian, params }
    }

    pub fn params(&self) -> &MoverParams {
        &self.params
    }

    pub fn wavefunction(&self) -> &TrialWaveFunction {
        self.wavefunction
    }

    /// Drift policy for this walker's next step; stuck walkers diffuse without drift.
    pub fn begin_step(&self, walker: &Walker, counters: &mut MoveCounters) -> DriftPolicy {
        if walker.is_stuck(self.params.max_age) {
            counters.refreshed += 1;
            trace!("walker aged {} steps, stepping without drift", walker.age);
            DriftPolicy::None
        } else {
            self.params.drift
        }
    }

    /// Update the age and the local energy once every move of the step is settled.
    pub fn finish_step(&self, walker: &mut Walker, moved: bool) {
        if moved {
            walker.age = 0;
        } else {
            walker.age += 1;
        }
        walker.old_local_energy = walker.local_energy;
        walker.local_energy = self.hamiltonian.local_energy(walker);
    }

    /// Draw a displacement for particle `iat`.
    pub fn propose(&self, walker: &mut Walker, iat: usize, drift: DriftPolicy) -> ProposedMove {
        let tau = self.params.tau;
        let old_pos = walker.positions[iat];
        let chi =
            Vector3::<f64>::from_distribution(&StandardNormal, &mut walker.rng) * tau.sqrt();
        let new_pos = old_pos + drift.drift(tau, &walker.trial.grads[iat]) + chi;
        ProposedMove {
            iat,
            old_pos,
            new_pos,
            log_gf: -chi.norm_squared() / (2.0 * tau),
            state: MoveState::Proposed,
        }
    }

    /// Evaluate the ratio for a proposal and accept or reject it.
    pub fn decide(
        &self,
        walker: &mut Walker,
        mv: &mut ProposedMove,
        drift: DriftPolicy,
        counters: &mut MoveCounters,
    ) -> Result<MoveState> {
        debug_assert_eq!(mv.state, MoveState::Proposed);
        let iat = mv.iat;
        let ratio = self.wavefunction.ratio_grad(
            &mut walker.trial,
            &walker.positions,
            iat,
            &mv.new_pos,
        )?;

        let forced = if ratio.singular || !ratio.ratio.is_finite() {
            counters.singular += 1;
            true
        } else if self.params.fixed_node && ratio.ratio < 0.0 {
            counters.nodal += 1;
            true
        } else {
            false
        };

        let accept = !forced && {
            let drift_back = drift.drift(self.params.tau, &ratio.grad);
            let log_gb = log_transition(self.params.tau, &mv.new_pos, &mv.old_pos, &drift_back);
            let prob = acceptance_probability(ratio.ratio, mv.log_gf, log_gb);
            walker.rng.gen::<f64>() < prob
        };

        if accept {
            self.wavefunction.accept_move(&mut walker.trial, iat)?;
            walker.positions[iat] = mv.new_pos;
            counters.accepted += 1;
            mv.state = MoveState::Accepted;
        } else {
            self.wavefunction.restore(&mut walker.trial, iat)?;
            counters.rejected += 1;
            mv.state = MoveState::Rejected;
        }
        Ok(mv.state)
    }

    pub fn move_particle(
        &self,
        walker: &mut Walker,
        iat: usize,
        drift: DriftPolicy,
        counters: &mut MoveCounters,
    ) -> Result<MoveState> {
        let mut mv = self.propose(walker, iat, drift);
        self.decide(walker, &mut mv, drift, counters)
    }

    /// Displace every particle at once and accept or reject the whole configuration.
    pub fn move_all(
        &self,
        walker: &mut Walker,
        slot: &mut ScratchSlot<'_>,
        drift: DriftPolicy,
        counters: &mut MoveCounters,
    ) -> Result<MoveState> {
        let tau = self.params.tau;
        let n = walker.num_particles();
        let mut log_gf = 0.0;
        for i in 0..n {
            let chi =
                Vector3::<f64>::from_distribution(&StandardNormal, &mut walker.rng) * tau.sqrt();
            slot.proposed[i] = walker.positions[i] + drift.drift(tau, &walker.trial.grads[i]) + chi;
            log_gf -= chi.norm_squared() / (2.0 * tau);
        }

        let trial = slot.trial.get_or_insert_with(|| walker.trial.clone());
        trial.clone_from(&walker.trial);
        match self.wavefunction.evaluate_log(trial, &slot.proposed[..n]) {
            Ok(_) => {}
            Err(QmcError::Singular(_)) => {
                counters.singular += 1;
                counters.rejected += n;
                return Ok(MoveState::Rejected);
            }
            Err(err) => return Err(err),
        }

        let sign = if trial.phase == walker.trial.phase { 1.0 } else { -1.0 };
        let ratio = sign * (trial.log_psi - walker.trial.log_psi).exp();
        if self.params.fixed_node && sign < 0.0 {
            counters.nodal += 1;
            counters.rejected += n;
            return Ok(MoveState::Rejected);
        }

        let log_gb: f64 = (0..n)
            .map(|i| {
                let back = drift.drift(tau, &trial.grads[i]);
                log_transition(tau, &slot.proposed[i], &walker.positions[i], &back)
            })
            .sum();
        let prob = acceptance_probability(ratio, log_gf, log_gb);
        if walker.rng.gen::<f64>() < prob {
            std::mem::swap(&mut walker.trial, trial);
            walker.positions.copy_from_slice(&slot.proposed[..n]);
            counters.accepted += n;
            Ok(MoveState::Accepted)
        } else {
            counters.rejected += n;
            Ok(MoveState::Rejected)
        }
    }

    /// One full step of a single walker: every particle in order, then age and local energy.
    pub fn advance_walker(
        &self,
        walker: &mut Walker,
        slot: &mut ScratchSlot<'_>,
    ) -> Result<MoveCounters> {
        let mut counters = MoveCounters::default();
        let drift = self.begin_step(walker, &mut counters);
        let moved = match self.params.mode {
            MoveMode::ParticleByParticle => {
                let mut moved = false;
                for iat in 0..walker.num_particles() {
                    if self.move_particle(walker, iat, drift, &mut counters)?
                        == MoveState::Accepted
                    {
                        moved = true;
                    }
                }
                moved
            }
            MoveMode::AllElectron => {
                self.move_all(walker, slot, drift, &mut counters)? == MoveState::Accepted
            }
        };
        self.finish_step(walker, moved);
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::sampling::arena::ScratchArena;
    use crate::systems::HarmonicPotential;
    use crate::wavefunction::{DiracDeterminant, GaussianOrbital, WaveFunctionComponent};

    fn params(drift: DriftPolicy, mode: MoveMode, fixed_node: bool) -> MoverParams {
        MoverParams { tau: 0.3, drift, mode, fixed_node, max_age: 10 }
    }

    fn gaussian_wf(alpha: f64) -> TrialWaveFunction {
        TrialWaveFunction::new(
            vec![WaveFunctionComponent::Determinant(DiracDeterminant::new(
                vec![Box::new(GaussianOrbital::new(alpha, Vector3::zeros(), 3))],
                0,
                1e-12,
            ))],
            1,
        )
    }

    /// Two particles in an antisymmetric pair of displaced Gaussians: Ψ changes sign when they
    /// trade places.
    fn nodal_wf() -> TrialWaveFunction {
        TrialWaveFunction::new(
            vec![WaveFunctionComponent::Determinant(DiracDeterminant::new(
                vec![
                    Box::new(GaussianOrbital::new(1.0, Vector3::new(0.5, 0.0, 0.0), 3)),
                    Box::new(GaussianOrbital::new(1.0, Vector3::new(-0.5, 0.0, 0.0), 3)),
                ],
                0,
                1e-12,
            ))],
            2,
        )
    }

    #[test]
    fn test_drift_policies() {
        let tau = 0.1;
        let small = Vector3::new(1e-4, 0.0, 0.0);
        let large = Vector3::new(1e6, 0.0, 0.0);
        assert_relative_eq!(DriftPolicy::Plain.drift(tau, &large).x, 1e5);
        assert_eq!(DriftPolicy::None.drift(tau, &large), Vector3::zeros());

        let umrigar = DriftPolicy::Umrigar { a: 1.0 };
        assert_relative_eq!(umrigar.drift(tau, &small).x, tau * 1e-4, max_relative = 1e-6);
        assert!(umrigar.drift(tau, &large).norm() <= (2.0 * tau).sqrt() + 1e-12);

        let capped = DriftPolicy::Capped { max: 0.5 };
        assert_relative_eq!(capped.drift(tau, &large).norm(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(capped.drift(tau, &small).x, tau * 1e-4);

        let bad = Vector3::new(f64::INFINITY, 0.0, 0.0);
        assert_eq!(umrigar.drift(tau, &bad), Vector3::zeros());
    }

    #[test]
    fn test_acceptance_probability_bounds() {
        assert_eq!(acceptance_probability(2.0, 0.0, 0.0), 1.0);
        assert_relative_eq!(acceptance_probability(0.5, 0.0, 0.0), 0.25);
        assert_relative_eq!(acceptance_probability(1.0, 0.0, -1.0), (-1.0f64).exp());
        assert_eq!(acceptance_probability(f64::NAN, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_rejected_moves_leave_walker_bit_identical() {
        let wf = nodal_wf();
        let ham = HarmonicPotential { omega: 1.0, dims: 3 };
        let mover = ParticleMover::new(
            &wf,
            &ham,
            params(DriftPolicy::default(), MoveMode::ParticleByParticle, true),
        );
        let positions = vec![Vector3::new(0.6, 0.1, 0.0), Vector3::new(-0.4, -0.2, 0.1)];
        let mut walker = Walker::new(positions, &wf, 17);
        walker.initialize(&wf, &ham).unwrap();

        let mut counters = MoveCounters::default();
        let mut rejections = 0;
        for step in 0..400 {
            let iat = step % 2;
            let before = walker.clone();
            let state = mover
                .move_particle(&mut walker, iat, DriftPolicy::default(), &mut counters)
                .unwrap();
            if state == MoveState::Rejected {
                rejections += 1;
                assert_eq!(walker.positions, before.positions);
                assert!(walker.trial.same_accepted_data(&before.trial));
                assert!(!walker.trial.has_pending_move());
            }
        }
        assert!(rejections > 0);
        assert!(counters.accepted > 0);
    }

    #[test]
    fn test_fixed_node_keeps_sign() {
        let wf = nodal_wf();
        let ham = HarmonicPotential { omega: 1.0, dims: 3 };
        let mut p = params(DriftPolicy::None, MoveMode::ParticleByParticle, true);
        p.tau = 1.5;
        let mover = ParticleMover::new(&wf, &ham, p);
        let positions = vec![Vector3::new(0.6, 0.0, 0.0), Vector3::new(-0.6, 0.0, 0.0)];
        let mut walker = Walker::new(positions, &wf, 3);
        walker.initialize(&wf, &ham).unwrap();
        let phase = walker.trial.phase;

        let mut counters = MoveCounters::default();
        for step in 0..2000 {
            mover.move_particle(&mut walker, step % 2, DriftPolicy::None, &mut counters).unwrap();
            assert_eq!(walker.trial.phase, phase);
        }
        assert!(counters.nodal > 0);
    }

    #[test]
    fn test_without_fixed_node_sign_can_flip() {
        let wf = nodal_wf();
        let ham = HarmonicPotential { omega: 1.0, dims: 3 };
        let mut p = params(DriftPolicy::None, MoveMode::ParticleByParticle, false);
        p.tau = 1.5;
        let mover = ParticleMover::new(&wf, &ham, p);
        let positions = vec![Vector3::new(0.6, 0.0, 0.0), Vector3::new(-0.6, 0.0, 0.0)];
        let mut walker = Walker::new(positions, &wf, 3);
        walker.initialize(&wf, &ham).unwrap();
        let phase = walker.trial.phase;

        let mut counters = MoveCounters::default();
        let mut flipped = false;
        for step in 0..2000 {
            mover.move_particle(&mut walker, step % 2, DriftPolicy::None, &mut counters).unwrap();
            flipped |= walker.trial.phase != phase;
        }
        assert!(flipped);
        assert_eq!(counters.nodal, 0);
    }

    #[test]
    fn test_stuck_walker_is_refreshed_and_age_resets() {
        let wf = gaussian_wf(1.0);
        let ham = HarmonicPotential { omega: 1.0, dims: 3 };
        let mut p = params(DriftPolicy::Plain, MoveMode::ParticleByParticle, false);
        p.max_age = 2;
        let mover = ParticleMover::new(&wf, &ham, p);
        let mut walker = Walker::new(vec![Vector3::new(0.1, 0.0, 0.0)], &wf, 9);
        walker.initialize(&wf, &ham).unwrap();
        walker.age = 3;

        let mut counters = MoveCounters::default();
        assert_eq!(mover.begin_step(&walker, &mut counters), DriftPolicy::None);
        assert_eq!(counters.refreshed, 1);

        mover.finish_step(&mut walker, false);
        assert_eq!(walker.age, 4);
        mover.finish_step(&mut walker, true);
        assert_eq!(walker.age, 0);
        assert_eq!(mover.begin_step(&walker, &mut counters), DriftPolicy::Plain);
    }

    #[test]
    fn test_all_electron_vmc_energy() {
        // ψ = exp(-αr²/2) in 3D with ω = 1: <E_L> = 3(α/4 + 1/(4α)).
        let alpha = 0.8;
        let wf = gaussian_wf(alpha);
        let ham = HarmonicPotential { omega: 1.0, dims: 3 };
        let mover =
            ParticleMover::new(&wf, &ham, params(DriftPolicy::Plain, MoveMode::AllElectron, false));
        let mut arena = ScratchArena::new(1);
        arena.resize(1);
        let handle = arena.handle(0).unwrap();

        let mut walker = Walker::new(vec![Vector3::new(0.2, -0.1, 0.3)], &wf, 23);
        walker.initialize(&wf, &ham).unwrap();
        let mut sum = 0.0;
        let mut counters = MoveCounters::default();
        let n_steps = 60_000;
        for step in 0..(n_steps + 1000) {
            let mut slot = arena.slot_mut(handle);
            counters += mover.advance_walker(&mut walker, &mut slot).unwrap();
            if step >= 1000 {
                sum += walker.local_energy;
            }
        }
        let expected = 3.0 * (alpha / 4.0 + 1.0 / (4.0 * alpha));
        assert_relative_eq!(sum / n_steps as f64, expected, epsilon = 0.02);
        assert!(counters.acceptance() > 0.3);
    }
}
