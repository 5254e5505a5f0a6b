//! Walkers and the local walker population.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::Result;
use crate::wavefunction::{TrialState, TrialWaveFunction};
use super::traits::EnergyCalculator;

/// One configuration of the ensemble together with everything cached for it.
///
/// Each walker owns its random stream, so the sequence of proposals it sees does not depend on
/// which thread runs it or on the order walkers are visited.
#[derive(Clone, Debug)]
pub struct Walker {
    pub positions: Vec<Vector3<f64>>,
    /// Accumulated branch weight since the last branching pass.
    pub weight: f64,
    /// Expected number of copies after the next branching pass.
    pub multiplicity: f64,
    /// Steps since the last accepted move.
    pub age: usize,
    pub local_energy: f64,
    /// Local energy before the most recent step.
    pub old_local_energy: f64,
    pub trial: TrialState,
    pub rng: StdRng,
}

impl Walker {
    pub fn new(positions: Vec<Vector3<f64>>, wavefunction: &TrialWaveFunction, seed: u64) -> Self {
        Self {
            positions,
            weight: 1.0,
            multiplicity: 1.0,
            age: 0,
            local_energy: 0.0,
            old_local_energy: 0.0,
            trial: wavefunction.new_state(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Fill every cache from `positions` and evaluate the local energy.
    pub fn initialize(
        &mut self,
        wavefunction: &TrialWaveFunction,
        hamiltonian: &dyn EnergyCalculator,
    ) -> Result<()> {
        wavefunction.evaluate_log(&mut self.trial, &self.positions)?;
        self.local_energy = hamiltonian.local_energy(self);
        self.old_local_energy = self.local_energy;
        Ok(())
    }

    pub fn num_particles(&self) -> usize {
        self.positions.len()
    }

    /// -½ Σᵢ (∇ᵢ² ln Ψ + |∇ᵢ ln Ψ|²)
    pub fn kinetic_energy(&self) -> f64 {
        -0.5 * self
            .trial
            .grads
            .iter()
            .zip(&self.trial.laps)
            .map(|(g, l)| l + g.norm_squared())
            .sum::<f64>()
    }

    pub fn log_psi(&self) -> f64 {
        self.trial.log_psi
    }

    /// Copy produced by branching: same configuration and caches, fresh random stream.
    pub fn branch_copy(&self, seed: u64) -> Self {
        let mut child = self.clone();
        child.rng = StdRng::seed_from_u64(seed);
        child
    }

    pub fn is_stuck(&self, max_age: usize) -> bool {
        self.age > max_age
    }
}

/// The walkers owned by this rank.
#[derive(Clone, Debug, Default)]
pub struct WalkerPopulation {
    walkers: Vec<Walker>,
}

impl WalkerPopulation {
    pub fn new(walkers: Vec<Walker>) -> Self {
        Self { walkers }
    }

    pub fn len(&self) -> usize {
        self.walkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.walkers.is_empty()
    }

    pub fn walkers(&self) -> &[Walker] {
        &self.walkers
    }

    pub fn walkers_mut(&mut self) -> &mut [Walker] {
        &mut self.walkers
    }

    /// Swap in a new generation, returning the old one.
    pub fn replace(&mut self, walkers: Vec<Walker>) -> Vec<Walker> {
        std::mem::replace(&mut self.walkers, walkers)
    }

    pub fn take(&mut self) -> Vec<Walker> {
        std::mem::take(&mut self.walkers)
    }

    pub fn total_weight(&self) -> f64 {
        self.walkers.iter().map(|w| w.weight).sum()
    }

    /// Σ w E_L / Σ w over the local walkers, or `None` when the total weight vanishes.
    pub fn weighted_energy(&self) -> Option<f64> {
        let (we, w) = self
            .walkers
            .iter()
            .fold((0.0, 0.0), |(we, w), walker| {
                (we + walker.weight * walker.local_energy, w + walker.weight)
            });
        if w > 0.0 {
            Some(we / w)
        } else {
            None
        }
    }

    pub fn reset_weights(&mut self) {
        for w in self.walkers.iter_mut() {
            w.weight = 1.0;
            w.multiplicity = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::Rng;
    use crate::systems::HarmonicPotential;
    use crate::wavefunction::{DiracDeterminant, GaussianOrbital, WaveFunctionComponent};

    fn oscillator(alpha: f64) -> TrialWaveFunction {
        TrialWaveFunction::new(
            vec![WaveFunctionComponent::Determinant(DiracDeterminant::new(
                vec![Box::new(GaussianOrbital::new(alpha, Vector3::zeros(), 1))],
                0,
                1e-12,
            ))],
            1,
        )
    }

    #[test]
    fn test_exact_trial_function_has_constant_local_energy() {
        let wf = oscillator(1.0);
        let ham = HarmonicPotential { omega: 1.0, dims: 1 };
        for x in [-1.3, 0.0, 0.4, 2.2] {
            let mut w = Walker::new(vec![Vector3::new(x, 0.0, 0.0)], &wf, 1);
            w.initialize(&wf, &ham).unwrap();
            assert_relative_eq!(w.local_energy, 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_branch_copy_reseeds_stream_only() {
        let wf = oscillator(0.8);
        let ham = HarmonicPotential { omega: 1.0, dims: 1 };
        let mut parent = Walker::new(vec![Vector3::new(0.3, 0.0, 0.0)], &wf, 5);
        parent.initialize(&wf, &ham).unwrap();
        let mut a = parent.branch_copy(10);
        let mut b = parent.branch_copy(11);
        assert_eq!(a.positions, parent.positions);
        assert!(a.trial.same_accepted_data(&parent.trial));
        let xa: f64 = a.rng.gen();
        let xb: f64 = b.rng.gen();
        assert_ne!(xa, xb);
    }

    #[test]
    fn test_weighted_energy() {
        let wf = oscillator(0.8);
        let mut walkers: Vec<Walker> =
            (0..3).map(|i| Walker::new(vec![Vector3::zeros()], &wf, i)).collect();
        for (i, w) in walkers.iter_mut().enumerate() {
            w.local_energy = i as f64;
            w.weight = 1.0 + i as f64;
        }
        let pop = WalkerPopulation::new(walkers);
        // (0*1 + 1*2 + 2*3) / 6
        assert_relative_eq!(pop.weighted_energy().unwrap(), 8.0 / 6.0, epsilon = 1e-14);
        assert_relative_eq!(pop.total_weight(), 6.0);
        assert!(WalkerPopulation::default().weighted_energy().is_none());
    }
}
