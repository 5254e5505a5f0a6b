//! Non-interacting particles in an isotropic harmonic trap.

use nalgebra::Vector3;

use crate::sampling::EnergyCalculator;
use crate::wavefunction::{
    DiracDeterminant, GaussianOrbital, TrialWaveFunction, WaveFunctionComponent,
};
use super::System;

/// V = ½ ω² Σᵢ Σ_{d<dims} x_{i,d}²
#[derive(Debug, Clone, Copy)]
pub struct HarmonicPotential {
    pub omega: f64,
    pub dims: usize,
}

impl EnergyCalculator for HarmonicPotential {
    fn potential(&self, positions: &[Vector3<f64>]) -> f64 {
        let dims = self.dims.clamp(1, 3);
        0.5 * self.omega * self.omega
            * positions
                .iter()
                .map(|r| r.iter().take(dims).map(|x| x * x).sum::<f64>())
                .sum::<f64>()
    }
}

/// `particles` distinguishable particles, each in its own Gaussian exp(-α x²/2).
///
/// Every particle gets a one-orbital determinant, so Ψ is a plain product and has no nodes.
/// α = ω is the exact ground state with E = particles · dims · ω / 2.
pub fn harmonic_system(
    particles: usize,
    omega: f64,
    alpha: f64,
    dims: usize,
    singular_floor: f64,
) -> System {
    let components = (0..particles)
        .map(|i| {
            WaveFunctionComponent::Determinant(DiracDeterminant::new(
                vec![Box::new(GaussianOrbital::new(alpha, Vector3::zeros(), dims))],
                i,
                singular_floor,
            ))
        })
        .collect();
    let dims = dims.clamp(1, 3);
    let exact = (alpha == omega).then(|| particles as f64 * dims as f64 * omega / 2.0);
    System {
        name: format!("harmonic-{particles}x{dims}d"),
        kind: "harmonic",
        wavefunction: TrialWaveFunction::new(components, particles),
        hamiltonian: Box::new(HarmonicPotential { omega, dims }),
        centers: vec![Vector3::zeros()],
        dims,
        init_width: 1.0 / alpha.sqrt(),
        exact_energy: exact,
    }
}
