//! Systems module - physical systems for QMC calculations.

mod atoms;
mod coulomb;
mod harmonic;

pub use atoms::{helium_system, hydrogen_system};
pub use coulomb::{CoulombPotential, Nucleus};
pub use harmonic::{harmonic_system, HarmonicPotential};

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{QmcError, Result};
use crate::sampling::EnergyCalculator;
use crate::wavefunction::TrialWaveFunction;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ThreeBodyConfig {
    pub coefficient: f64,
    pub kappa: f64,
}

/// Which system to simulate, as it appears under `system:` in the run configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SystemConfig {
    Harmonic {
        particles: usize,
        omega: f64,
        alpha: f64,
        dims: usize,
    },
    Hydrogen {
        alpha: f64,
    },
    Helium {
        alpha: f64,
        jastrow_b: f64,
        #[serde(default)]
        three_body: Option<ThreeBodyConfig>,
    },
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig::Harmonic { particles: 1, omega: 1.0, alpha: 1.0, dims: 1 }
    }
}

impl SystemConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SystemConfig::Harmonic { .. } => "harmonic",
            SystemConfig::Hydrogen { .. } => "hydrogen",
            SystemConfig::Helium { .. } => "helium",
        }
    }

    /// Active Cartesian dimensions.
    pub fn dims(&self) -> usize {
        match self {
            SystemConfig::Harmonic { dims, .. } => *dims,
            SystemConfig::Hydrogen { .. } | SystemConfig::Helium { .. } => 3,
        }
    }

    pub fn num_particles(&self) -> usize {
        match self {
            SystemConfig::Harmonic { particles, .. } => *particles,
            SystemConfig::Hydrogen { .. } => 1,
            SystemConfig::Helium { .. } => 2,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, x: f64| {
            if x > 0.0 && x.is_finite() {
                Ok(())
            } else {
                Err(QmcError::Config(format!("system parameter {name} must be positive, got {x}")))
            }
        };
        match self {
            SystemConfig::Harmonic { particles, omega, alpha, dims } => {
                if *particles == 0 {
                    return Err(QmcError::Config(
                        "harmonic system needs at least one particle".into(),
                    ));
                }
                if !(1..=3).contains(dims) {
                    return Err(QmcError::Config(format!("dims must be 1, 2 or 3, got {dims}")));
                }
                positive("omega", *omega)?;
                positive("alpha", *alpha)
            }
            SystemConfig::Hydrogen { alpha } => positive("alpha", *alpha),
            SystemConfig::Helium { alpha, jastrow_b, three_body } => {
                positive("alpha", *alpha)?;
                positive("jastrow_b", *jastrow_b)?;
                if let Some(tb) = three_body {
                    positive("kappa", tb.kappa)?;
                }
                Ok(())
            }
        }
    }
}

/// A trial wavefunction together with the Hamiltonian it is sampled against.
pub struct System {
    pub name: String,
    /// Same tag as `SystemConfig::kind`.
    pub kind: &'static str,
    pub wavefunction: TrialWaveFunction,
    pub hamiltonian: Box<dyn EnergyCalculator>,
    /// Particle i starts near `centers[i % centers.len()]`.
    pub centers: Vec<Vector3<f64>>,
    /// Active Cartesian dimensions; coordinates beyond stay at zero.
    pub dims: usize,
    pub init_width: f64,
    pub exact_energy: Option<f64>,
}

impl System {
    pub fn num_particles(&self) -> usize {
        self.wavefunction.num_particles()
    }

    /// Gaussian scatter around the centers.
    pub fn initial_positions<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<Vector3<f64>> {
        (0..self.num_particles())
            .map(|i| {
                let center = self
                    .centers
                    .get(i % self.centers.len().max(1))
                    .copied()
                    .unwrap_or_else(Vector3::zeros);
                let mut r = center;
                for d in 0..self.dims {
                    let x: f64 = rng.sample(StandardNormal);
                    r[d] += self.init_width * x;
                }
                r
            })
            .collect()
    }
}

pub fn build_system(config: &SystemConfig, singular_floor: f64) -> Result<System> {
    config.validate()?;
    Ok(match config {
        SystemConfig::Harmonic { particles, omega, alpha, dims } => {
            harmonic_system(*particles, *omega, *alpha, *dims, singular_floor)
        }
        SystemConfig::Hydrogen { alpha } => hydrogen_system(*alpha, singular_floor),
        SystemConfig::Helium { alpha, jastrow_b, three_body } => {
            helium_system(*alpha, *jastrow_b, three_body.as_ref(), singular_floor)
        }
    })
}
