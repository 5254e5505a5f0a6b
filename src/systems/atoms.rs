//! One- and two-electron atoms.

use nalgebra::Vector3;

use crate::correlation::{ThreeBodyJastrow, TwoBodyJastrow};
use crate::wavefunction::{
    DiracDeterminant, OrbitalBox, Slater1s, TrialWaveFunction, WaveFunctionComponent,
};
use super::{CoulombPotential, System, ThreeBodyConfig};

fn slater_1s(alpha: f64) -> OrbitalBox {
    Box::new(Slater1s { alpha, center: Vector3::zeros() })
}

/// One-electron 1s determinant for the particle at index `first`.
fn spin_block(alpha: f64, first: usize, singular_floor: f64) -> WaveFunctionComponent {
    WaveFunctionComponent::Determinant(DiracDeterminant::new(
        vec![slater_1s(alpha)],
        first,
        singular_floor,
    ))
}

/// Hydrogen with ψ = exp(-α r); α = 1 is exact with E = -1/2.
pub fn hydrogen_system(alpha: f64, singular_floor: f64) -> System {
    let wavefunction = TrialWaveFunction::new(
        vec![spin_block(alpha, 0, singular_floor)],
        1,
    );
    System {
        name: "hydrogen".to_string(),
        kind: "hydrogen",
        wavefunction,
        hamiltonian: Box::new(CoulombPotential::atom(1.0)),
        centers: vec![Vector3::zeros()],
        dims: 3,
        init_width: 1.0 / alpha,
        exact_energy: (alpha == 1.0).then_some(-0.5),
    }
}

/// Helium: one spin-up and one spin-down 1s determinant times a cusp-correct Padé Jastrow, with
/// an optional electron-electron-nucleus term.
pub fn helium_system(
    alpha: f64,
    jastrow_b: f64,
    three_body: Option<&ThreeBodyConfig>,
    singular_floor: f64,
) -> System {
    let mut components = vec![
        spin_block(alpha, 0, singular_floor),
        spin_block(alpha, 1, singular_floor),
        WaveFunctionComponent::TwoBodyJastrow(TwoBodyJastrow::with_cusps(2, 1, jastrow_b)),
    ];
    if let Some(tb) = three_body {
        components.push(WaveFunctionComponent::ThreeBodyJastrow(ThreeBodyJastrow::new(
            2,
            vec![Vector3::zeros()],
            vec![tb.coefficient],
            tb.kappa,
        )));
    }
    System {
        name: "helium".to_string(),
        kind: "helium",
        wavefunction: TrialWaveFunction::new(components, 2),
        hamiltonian: Box::new(CoulombPotential::atom(2.0)),
        centers: vec![Vector3::zeros()],
        dims: 3,
        init_width: 1.0 / alpha,
        exact_energy: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::sampling::Walker;

    #[test]
    fn test_exact_hydrogen_local_energy() {
        let system = hydrogen_system(1.0, 1e-12);
        for r in [Vector3::new(0.3, 0.1, -0.2), Vector3::new(2.0, -1.0, 0.5)] {
            let mut walker = Walker::new(vec![r], &system.wavefunction, 0);
            walker.initialize(&system.wavefunction, system.hamiltonian.as_ref()).unwrap();
            assert_relative_eq!(walker.local_energy, -0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_helium_local_energy_without_jastrow_term() {
        // For ψ = exp(-α(r1 + r2)) the local energy is -α² + (α - 2)(1/r1 + 1/r2) + 1/r12.
        // A huge Padé b flattens the Jastrow to a constant.
        let alpha = 1.6875;
        let system = helium_system(alpha, 1e12, None, 1e-12);
        let r = vec![Vector3::new(0.4, 0.2, 0.1), Vector3::new(-0.3, 0.5, -0.6)];
        let mut walker = Walker::new(r.clone(), &system.wavefunction, 0);
        walker.initialize(&system.wavefunction, system.hamiltonian.as_ref()).unwrap();
        let (r1, r2, r12) = (r[0].norm(), r[1].norm(), (r[0] - r[1]).norm());
        let expected = -alpha * alpha + (alpha - 2.0) * (1.0 / r1 + 1.0 / r2) + 1.0 / r12;
        assert_relative_eq!(walker.local_energy, expected, epsilon = 1e-9);
    }
}
