//! Bare Coulomb interaction between electrons and point nuclei.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::sampling::EnergyCalculator;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Nucleus {
    pub charge: f64,
    pub position: Vector3<f64>,
}

/// V = -Σ_{i,I} Z_I / r_iI + Σ_{i<j} 1 / r_ij + Σ_{I<J} Z_I Z_J / R_IJ
#[derive(Debug, Clone, Default)]
pub struct CoulombPotential {
    pub nuclei: Vec<Nucleus>,
}

impl CoulombPotential {
    /// A single nucleus of charge `z` at the origin.
    pub fn atom(z: f64) -> Self {
        Self { nuclei: vec![Nucleus { charge: z, position: Vector3::zeros() }] }
    }

    fn ion_ion(&self) -> f64 {
        let n = self.nuclei.len();
        (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .map(|(i, j)| {
                let (a, b) = (&self.nuclei[i], &self.nuclei[j]);
                a.charge * b.charge / (a.position - b.position).norm()
            })
            .sum()
    }
}

impl EnergyCalculator for CoulombPotential {
    fn potential(&self, r: &[Vector3<f64>]) -> f64 {
        let v_en: f64 = r
            .iter()
            .flat_map(|ri| {
                self.nuclei
                    .iter()
                    .map(move |nuc| -nuc.charge / (ri - nuc.position).norm())
            })
            .sum();

        let n = r.len();
        let v_ee: f64 = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .map(|(i, j)| 1.0 / (r[i] - r[j]).norm())
            .sum();

        v_en + v_ee + self.ion_ion()
    }
}
