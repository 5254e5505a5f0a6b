//! Trial wavefunction as a product of components.
//!
//! Ψ_T(R) = Π_c Ψ_c(R). Every component speaks the same incremental protocol:
//!
//! 1. `ratio_grad` for a proposed single-particle move fills the component's trial buffers and
//!    returns Ψ_c(R')/Ψ_c(R) together with ∇ ln Ψ_c and ∇² ln Ψ_c at the new position;
//! 2. `accept_move` promotes the trial buffers into the accepted cache;
//! 3. `restore` drops them.
//!
//! Nothing in the accepted cache is written before `accept_move`, so a rejected proposal leaves
//! it exactly as it was.

use std::f64::consts::PI;

use nalgebra::Vector3;

use crate::correlation::{JastrowState, ThreeBodyJastrow, ThreeBodyState, TwoBodyJastrow};
use crate::error::{QmcError, Result};
use super::determinant::{DeterminantState, DiracDeterminant};

/// Outcome of a ratio query for one proposed single-particle move.
#[derive(Clone, Copy, Debug)]
pub struct MoveRatio {
    /// Ψ(R') / Ψ(R)
    pub ratio: f64,
    /// ∇ ln Ψ for the moved particle at its new position.
    pub grad: Vector3<f64>,
    /// ∇² ln Ψ for the moved particle at its new position.
    pub lap: f64,
    /// A determinant ratio fell under the singular floor; the move must be rejected.
    pub singular: bool,
}

impl MoveRatio {
    pub fn unity() -> Self {
        Self { ratio: 1.0, grad: Vector3::zeros(), lap: 0.0, singular: false }
    }

    fn combine(self, other: MoveRatio) -> MoveRatio {
        MoveRatio {
            ratio: self.ratio * other.ratio,
            grad: self.grad + other.grad,
            lap: self.lap + other.lap,
            singular: self.singular || other.singular,
        }
    }
}

pub enum WaveFunctionComponent {
    Determinant(DiracDeterminant),
    TwoBodyJastrow(TwoBodyJastrow),
    ThreeBodyJastrow(ThreeBodyJastrow),
}

#[derive(Clone, Debug)]
pub enum ComponentState {
    Determinant(DeterminantState),
    TwoBodyJastrow(JastrowState),
    ThreeBodyJastrow(ThreeBodyState),
}

fn mismatch() -> QmcError {
    QmcError::Config("wavefunction state was built for a different wavefunction".into())
}

impl ComponentState {
    /// (∇ ln Ψ_c, ∇² ln Ψ_c) for particle `iat` from the accepted cache.
    fn derivatives(
        &self,
        component: &WaveFunctionComponent,
        iat: usize,
    ) -> Result<(Vector3<f64>, f64)> {
        match (component, self) {
            (WaveFunctionComponent::Determinant(det), ComponentState::Determinant(s)) => {
                if det.contains(iat) {
                    Ok((s.grad(iat - det.first), s.lap(iat - det.first)))
                } else {
                    Ok((Vector3::zeros(), 0.0))
                }
            }
            (WaveFunctionComponent::TwoBodyJastrow(_), ComponentState::TwoBodyJastrow(s)) => {
                Ok((s.grad(iat), s.lap(iat)))
            }
            (WaveFunctionComponent::ThreeBodyJastrow(_), ComponentState::ThreeBodyJastrow(s)) => {
                Ok((s.grad(iat), s.lap(iat)))
            }
            _ => Err(mismatch()),
        }
    }

    fn matches(&self, component: &WaveFunctionComponent) -> bool {
        matches!(
            (component, self),
            (WaveFunctionComponent::Determinant(_), ComponentState::Determinant(_))
                | (WaveFunctionComponent::TwoBodyJastrow(_), ComponentState::TwoBodyJastrow(_))
                | (WaveFunctionComponent::ThreeBodyJastrow(_), ComponentState::ThreeBodyJastrow(_))
        )
    }
}

impl WaveFunctionComponent {
    pub fn new_state(&self) -> ComponentState {
        match self {
            WaveFunctionComponent::Determinant(c) => ComponentState::Determinant(c.new_state()),
            WaveFunctionComponent::TwoBodyJastrow(c) => {
                ComponentState::TwoBodyJastrow(c.new_state())
            }
            WaveFunctionComponent::ThreeBodyJastrow(c) => {
                ComponentState::ThreeBodyJastrow(c.new_state())
            }
        }
    }

    /// Full evaluation from scratch; returns (ln|Ψ_c|, phase).
    pub fn evaluate_log(
        &self,
        state: &mut ComponentState,
        positions: &[Vector3<f64>],
    ) -> Result<(f64, f64)> {
        match (self, state) {
            (WaveFunctionComponent::Determinant(c), ComponentState::Determinant(s)) => {
                c.evaluate_log(s, positions)
            }
            (WaveFunctionComponent::TwoBodyJastrow(c), ComponentState::TwoBodyJastrow(s)) => {
                Ok((c.evaluate_log(s, positions), 0.0))
            }
            (WaveFunctionComponent::ThreeBodyJastrow(c), ComponentState::ThreeBodyJastrow(s)) => {
                Ok((c.evaluate_log(s, positions), 0.0))
            }
            _ => Err(mismatch()),
        }
    }

    pub fn ratio_grad(
        &self,
        state: &mut ComponentState,
        positions: &[Vector3<f64>],
        iat: usize,
        new_pos: &Vector3<f64>,
    ) -> Result<MoveRatio> {
        match (self, state) {
            (WaveFunctionComponent::Determinant(c), ComponentState::Determinant(s)) => {
                Ok(c.ratio_grad(s, iat, new_pos))
            }
            (WaveFunctionComponent::TwoBodyJastrow(c), ComponentState::TwoBodyJastrow(s)) => {
                Ok(c.ratio_grad(s, positions, iat, new_pos))
            }
            (WaveFunctionComponent::ThreeBodyJastrow(c), ComponentState::ThreeBodyJastrow(s)) => {
                Ok(c.ratio_grad(s, iat, new_pos))
            }
            _ => Err(mismatch()),
        }
    }

    pub fn accept_move(&self, state: &mut ComponentState, iat: usize) -> Result<()> {
        match (self, state) {
            (WaveFunctionComponent::Determinant(c), ComponentState::Determinant(s)) => {
                c.accept_move(s, iat)
            }
            (WaveFunctionComponent::TwoBodyJastrow(c), ComponentState::TwoBodyJastrow(s)) => {
                c.accept_move(s, iat);
                Ok(())
            }
            (WaveFunctionComponent::ThreeBodyJastrow(c), ComponentState::ThreeBodyJastrow(s)) => {
                c.accept_move(s, iat);
                Ok(())
            }
            _ => Err(mismatch()),
        }
    }

    pub fn restore(&self, state: &mut ComponentState, iat: usize) -> Result<()> {
        match (self, state) {
            (WaveFunctionComponent::Determinant(c), ComponentState::Determinant(s)) => {
                c.restore(s, iat)
            }
            (WaveFunctionComponent::TwoBodyJastrow(c), ComponentState::TwoBodyJastrow(s)) => {
                c.restore(s, iat)
            }
            (WaveFunctionComponent::ThreeBodyJastrow(c), ComponentState::ThreeBodyJastrow(s)) => {
                c.restore(s, iat)
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }
}

/// Cached wavefunction data carried by each walker.
#[derive(Clone, Debug)]
pub struct TrialState {
    pub components: Vec<ComponentState>,
    /// ln|Ψ_T|
    pub log_psi: f64,
    /// 0 or π
    pub phase: f64,
    /// ∇ᵢ ln Ψ_T per particle.
    pub grads: Vec<Vector3<f64>>,
    /// ∇ᵢ² ln Ψ_T per particle.
    pub laps: Vec<f64>,
    pending: Option<(usize, MoveRatio)>,
}

impl TrialState {
    /// Whether a proposed move is awaiting accept or restore.
    pub fn has_pending_move(&self) -> bool {
        self.pending.is_some()
    }

    /// Accepted-cache comparison used to check that rejection does not leak trial data.
    pub fn same_accepted_data(&self, other: &TrialState) -> bool {
        self.log_psi.to_bits() == other.log_psi.to_bits()
            && self.phase.to_bits() == other.phase.to_bits()
            && self.grads == other.grads
            && self.laps.iter().zip(&other.laps).all(|(a, b)| a.to_bits() == b.to_bits())
            && self.components.iter().zip(&other.components).all(|pair| match pair {
                (ComponentState::Determinant(a), ComponentState::Determinant(b)) => {
                    a.updater.inverse() == b.updater.inverse()
                        && a.updater.matrix() == b.updater.matrix()
                        && a.updater.log_value().to_bits() == b.updater.log_value().to_bits()
                }
                (ComponentState::TwoBodyJastrow(a), ComponentState::TwoBodyJastrow(b)) => {
                    a.log_value().to_bits() == b.log_value().to_bits()
                }
                (ComponentState::ThreeBodyJastrow(a), ComponentState::ThreeBodyJastrow(b)) => {
                    a.log_value().to_bits() == b.log_value().to_bits()
                }
                _ => false,
            })
    }
}

/// Product of wavefunction components over a fixed number of particles.
pub struct TrialWaveFunction {
    components: Vec<WaveFunctionComponent>,
    n_particles: usize,
}

impl TrialWaveFunction {
    pub fn new(components: Vec<WaveFunctionComponent>, n_particles: usize) -> Self {
        Self { components, n_particles }
    }

    pub fn num_particles(&self) -> usize {
        self.n_particles
    }

    pub fn components(&self) -> &[WaveFunctionComponent] {
        &self.components
    }

    pub fn new_state(&self) -> TrialState {
        TrialState {
            components: self.components.iter().map(|c| c.new_state()).collect(),
            log_psi: 0.0,
            phase: 0.0,
            grads: vec![Vector3::zeros(); self.n_particles],
            laps: vec![0.0; self.n_particles],
            pending: None,
        }
    }

    /// A state from another wavefunction would pair components with the wrong caches.
    fn check_state(&self, state: &TrialState) -> Result<()> {
        let layout_ok = state.components.len() == self.components.len()
            && state.grads.len() == self.n_particles
            && state.laps.len() == self.n_particles
            && state.components.iter().zip(&self.components).all(|(s, c)| s.matches(c));
        if layout_ok {
            Ok(())
        } else {
            Err(mismatch())
        }
    }

    fn collect_derivatives(&self, state: &mut TrialState) -> Result<()> {
        for iat in 0..self.n_particles {
            let mut g = Vector3::zeros();
            let mut l = 0.0;
            for (c, s) in self.components.iter().zip(&state.components) {
                let (dg, dl) = s.derivatives(c, iat)?;
                g += dg;
                l += dl;
            }
            state.grads[iat] = g;
            state.laps[iat] = l;
        }
        Ok(())
    }

    /// Recompute every cache from `positions`; returns (ln|Ψ_T|, phase).
    pub fn evaluate_log(
        &self,
        state: &mut TrialState,
        positions: &[Vector3<f64>],
    ) -> Result<(f64, f64)> {
        self.check_state(state)?;
        let mut log_psi = 0.0;
        let mut phase = 0.0;
        for (c, s) in self.components.iter().zip(state.components.iter_mut()) {
            let (l, p) = c.evaluate_log(s, positions)?;
            log_psi += l;
            phase += p;
        }
        state.log_psi = log_psi;
        state.phase = phase.rem_euclid(2.0 * PI);
        state.pending = None;
        self.collect_derivatives(state)?;
        Ok((state.log_psi, state.phase))
    }

    /// Ratio of the full product for moving particle `iat` to `new_pos`.
    pub fn ratio_grad(
        &self,
        state: &mut TrialState,
        positions: &[Vector3<f64>],
        iat: usize,
        new_pos: &Vector3<f64>,
    ) -> Result<MoveRatio> {
        self.check_state(state)?;
        let mut combined = MoveRatio::unity();
        for (c, s) in self.components.iter().zip(state.components.iter_mut()) {
            combined = combined.combine(c.ratio_grad(s, positions, iat, new_pos)?);
        }
        state.pending = Some((iat, combined));
        Ok(combined)
    }

    /// Commit the pending move of particle `iat` in every component.
    pub fn accept_move(&self, state: &mut TrialState, iat: usize) -> Result<()> {
        self.check_state(state)?;
        let ratio = match state.pending.take() {
            Some((pending_iat, mv)) if pending_iat == iat => mv.ratio,
            _ => return Err(QmcError::Config(format!(
                "accept_move for particle {iat} without a matching ratio_grad"
            ))),
        };
        for (c, s) in self.components.iter().zip(state.components.iter_mut()) {
            c.accept_move(s, iat)?;
        }
        state.log_psi += ratio.abs().ln();
        if ratio < 0.0 {
            state.phase = (state.phase + PI).rem_euclid(2.0 * PI);
        }
        self.collect_derivatives(state)
    }

    /// Drop the pending move of particle `iat`.
    pub fn restore(&self, state: &mut TrialState, iat: usize) -> Result<()> {
        self.check_state(state)?;
        for (c, s) in self.components.iter().zip(state.components.iter_mut()) {
            c.restore(s, iat)?;
        }
        state.pending = None;
        Ok(())
    }

    /// ∇ ln Ψ_T for particle `iat` from the accepted cache.
    pub fn grad(&self, state: &TrialState, iat: usize) -> Vector3<f64> {
        state.grads[iat]
    }

    /// Resynchronize the caches with a full recompute.
    ///
    /// Returns the difference between the incrementally tracked and the recomputed ln|Ψ_T|,
    /// which measures the accumulated round-off.
    pub fn recompute(&self, state: &mut TrialState, positions: &[Vector3<f64>]) -> Result<f64> {
        let incremental = state.log_psi;
        let (fresh, _) = self.evaluate_log(state, positions)?;
        Ok(incremental - fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::correlation::TwoBodyJastrow;
    use crate::wavefunction::slater::Slater1s;

    fn helium_like() -> TrialWaveFunction {
        let orb = || {
            Box::new(Slater1s { alpha: 1.6875, center: Vector3::zeros() })
                as crate::wavefunction::OrbitalBox
        };
        TrialWaveFunction::new(
            vec![
                WaveFunctionComponent::Determinant(DiracDeterminant::new(vec![orb()], 0, 1e-12)),
                WaveFunctionComponent::Determinant(DiracDeterminant::new(vec![orb()], 1, 1e-12)),
                WaveFunctionComponent::TwoBodyJastrow(TwoBodyJastrow::with_cusps(2, 1, 1.0)),
            ],
            2,
        )
    }

    #[test]
    fn test_log_psi_is_sum_of_components() {
        let wf = helium_like();
        let positions = vec![Vector3::new(0.3, 0.1, 0.0), Vector3::new(-0.2, 0.5, 0.4)];
        let mut state = wf.new_state();
        let (log_psi, phase) = wf.evaluate_log(&mut state, &positions).unwrap();
        let r1 = positions[0].norm();
        let r2 = positions[1].norm();
        let r12 = (positions[0] - positions[1]).norm();
        let expected = -1.6875 * (r1 + r2) + 0.5 * r12 / (1.0 + r12);
        assert_relative_eq!(log_psi, expected, epsilon = 1e-12);
        assert_eq!(phase, 0.0);
    }

    #[test]
    fn test_accept_then_recompute_has_no_drift() {
        let wf = helium_like();
        let mut positions = vec![Vector3::new(0.3, 0.1, 0.0), Vector3::new(-0.2, 0.5, 0.4)];
        let mut state = wf.new_state();
        wf.evaluate_log(&mut state, &positions).unwrap();
        let moves = [
            (0, Vector3::new(0.1, 0.2, -0.3)),
            (1, Vector3::new(0.4, -0.1, 0.2)),
            (0, Vector3::new(-0.5, 0.0, 0.1)),
        ];
        for (iat, new_pos) in moves {
            wf.ratio_grad(&mut state, &positions, iat, &new_pos).unwrap();
            wf.accept_move(&mut state, iat).unwrap();
            positions[iat] = new_pos;
        }
        let grads = state.grads.clone();
        let drift = wf.recompute(&mut state, &positions).unwrap();
        assert_relative_eq!(drift, 0.0, epsilon = 1e-12);
        for (g, h) in grads.iter().zip(&state.grads) {
            assert_relative_eq!((g - h).norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_restore_leaves_accepted_cache_identical() {
        let wf = helium_like();
        let positions = vec![Vector3::new(0.3, 0.1, 0.0), Vector3::new(-0.2, 0.5, 0.4)];
        let mut state = wf.new_state();
        wf.evaluate_log(&mut state, &positions).unwrap();
        let before = state.clone();
        wf.ratio_grad(&mut state, &positions, 1, &Vector3::new(2.0, 2.0, 2.0)).unwrap();
        assert!(state.has_pending_move());
        wf.restore(&mut state, 1).unwrap();
        assert!(!state.has_pending_move());
        assert!(state.same_accepted_data(&before));
    }

    #[test]
    fn test_accept_without_ratio_is_an_error() {
        let wf = helium_like();
        let positions = vec![Vector3::new(0.3, 0.1, 0.0), Vector3::new(-0.2, 0.5, 0.4)];
        let mut state = wf.new_state();
        wf.evaluate_log(&mut state, &positions).unwrap();
        assert!(wf.accept_move(&mut state, 0).is_err());
    }

    #[test]
    fn test_state_from_another_wavefunction_is_rejected() {
        let wf = helium_like();
        let positions = vec![Vector3::new(0.3, 0.1, 0.0), Vector3::new(-0.2, 0.5, 0.4)];
        let other = TrialWaveFunction::new(
            vec![
                WaveFunctionComponent::TwoBodyJastrow(TwoBodyJastrow::with_cusps(2, 1, 1.0)),
                WaveFunctionComponent::Determinant(DiracDeterminant::new(
                    vec![Box::new(Slater1s { alpha: 1.0, center: Vector3::zeros() })],
                    0,
                    1e-12,
                )),
                WaveFunctionComponent::Determinant(DiracDeterminant::new(
                    vec![Box::new(Slater1s { alpha: 1.0, center: Vector3::zeros() })],
                    1,
                    1e-12,
                )),
            ],
            2,
        );
        let mut foreign = other.new_state();
        other.evaluate_log(&mut foreign, &positions).unwrap();

        let new_pos = Vector3::new(0.1, 0.1, 0.1);
        assert!(matches!(wf.evaluate_log(&mut foreign, &positions), Err(QmcError::Config(_))));
        assert!(matches!(
            wf.ratio_grad(&mut foreign, &positions, 0, &new_pos),
            Err(QmcError::Config(_))
        ));
        assert!(matches!(wf.accept_move(&mut foreign, 0), Err(QmcError::Config(_))));
        assert!(matches!(wf.restore(&mut foreign, 0), Err(QmcError::Config(_))));
    }
}
