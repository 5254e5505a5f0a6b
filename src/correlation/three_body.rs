//! Separable electron-electron-ion Jastrow.
//!
//! U(R) = Σ_I c_I Σᵢ<ⱼ f(r_iI) f(r_jI),   f(r) = exp(-κ r)
//!
//! Writing S_I = Σᵢ f(r_iI), the pair sum for ion I is (S_I² - Σᵢ f(r_iI)²) / 2, so moving
//! one electron only needs the per-ion sums and costs O(N_ion).

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::wavefunction::MoveRatio;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ThreeBodyJastrow {
    pub n_particles: usize,
    pub ions: Vec<Vector3<f64>>,
    pub coefficients: Vec<f64>,
    pub kappa: f64,
}

#[derive(Clone, Debug)]
pub struct ThreeBodyState {
    /// f(r_iI), particle-by-ion.
    f: DMatrix<f64>,
    /// ∇ᵢ f(r_iI), row-major over (i, I).
    df: Vec<Vector3<f64>>,
    d2f: DMatrix<f64>,
    sums: Vec<f64>,
    grads: Vec<Vector3<f64>>,
    laps: Vec<f64>,
    log_value: f64,
    trial_f: Vec<f64>,
    trial_df: Vec<Vector3<f64>>,
    trial_d2f: Vec<f64>,
    trial_delta: f64,
}

impl ThreeBodyState {
    pub fn log_value(&self) -> f64 {
        self.log_value
    }

    pub fn grad(&self, iat: usize) -> Vector3<f64> {
        self.grads[iat]
    }

    pub fn lap(&self, iat: usize) -> f64 {
        self.laps[iat]
    }
}

impl ThreeBodyJastrow {
    pub fn new(
        n_particles: usize,
        ions: Vec<Vector3<f64>>,
        coefficients: Vec<f64>,
        kappa: f64,
    ) -> Self {
        Self { n_particles, ions, coefficients, kappa }
    }

    fn n_ions(&self) -> usize {
        self.ions.len()
    }

    #[inline]
    fn envelope(&self, r: &Vector3<f64>, ion: &Vector3<f64>) -> (f64, Vector3<f64>, f64) {
        let dr = r - ion;
        let d = dr.norm().max(1e-12);
        let f = (-self.kappa * d).exp();
        let grad = dr * (-self.kappa * f / d);
        let lap = (self.kappa * self.kappa - 2.0 * self.kappa / d) * f;
        (f, grad, lap)
    }

    pub fn new_state(&self) -> ThreeBodyState {
        let n = self.n_particles;
        let m = self.n_ions();
        ThreeBodyState {
            f: DMatrix::zeros(n, m),
            df: vec![Vector3::zeros(); n * m],
            d2f: DMatrix::zeros(n, m),
            sums: vec![0.0; m],
            grads: vec![Vector3::zeros(); n],
            laps: vec![0.0; n],
            log_value: 0.0,
            trial_f: vec![0.0; m],
            trial_df: vec![Vector3::zeros(); m],
            trial_d2f: vec![0.0; m],
            trial_delta: 0.0,
        }
    }

    fn refresh_derivatives(&self, state: &mut ThreeBodyState) {
        let m = self.n_ions();
        for i in 0..self.n_particles {
            let mut g = Vector3::zeros();
            let mut l = 0.0;
            for ion in 0..m {
                let others = self.coefficients[ion] * (state.sums[ion] - state.f[(i, ion)]);
                g += state.df[i * m + ion] * others;
                l += state.d2f[(i, ion)] * others;
            }
            state.grads[i] = g;
            state.laps[i] = l;
        }
    }

    pub fn evaluate_log(&self, state: &mut ThreeBodyState, positions: &[Vector3<f64>]) -> f64 {
        let m = self.n_ions();
        let mut log_value = 0.0;
        for (ion, center) in self.ions.iter().enumerate() {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            for i in 0..self.n_particles {
                let (f, g, l) = self.envelope(&positions[i], center);
                state.f[(i, ion)] = f;
                state.df[i * m + ion] = g;
                state.d2f[(i, ion)] = l;
                sum += f;
                sum_sq += f * f;
            }
            state.sums[ion] = sum;
            log_value += 0.5 * self.coefficients[ion] * (sum * sum - sum_sq);
        }
        self.refresh_derivatives(state);
        state.log_value = log_value;
        log_value
    }

    pub fn ratio_grad(
        &self,
        state: &mut ThreeBodyState,
        iat: usize,
        new_pos: &Vector3<f64>,
    ) -> MoveRatio {
        let mut delta = 0.0;
        let mut grad = Vector3::zeros();
        let mut lap = 0.0;
        for (ion, center) in self.ions.iter().enumerate() {
            let (f, g, l) = self.envelope(new_pos, center);
            let others = state.sums[ion] - state.f[(iat, ion)];
            let c = self.coefficients[ion];
            delta += c * (f - state.f[(iat, ion)]) * others;
            grad += g * (c * others);
            lap += l * c * others;
            state.trial_f[ion] = f;
            state.trial_df[ion] = g;
            state.trial_d2f[ion] = l;
        }
        state.trial_delta = delta;
        MoveRatio { ratio: delta.exp(), grad, lap, singular: false }
    }

    pub fn accept_move(&self, state: &mut ThreeBodyState, iat: usize) {
        let m = self.n_ions();
        for ion in 0..m {
            state.sums[ion] += state.trial_f[ion] - state.f[(iat, ion)];
            state.f[(iat, ion)] = state.trial_f[ion];
            state.df[iat * m + ion] = state.trial_df[ion];
            state.d2f[(iat, ion)] = state.trial_d2f[ion];
        }
        self.refresh_derivatives(state);
        state.log_value += state.trial_delta;
        state.trial_delta = 0.0;
    }

    pub fn restore(&self, state: &mut ThreeBodyState, _iat: usize) {
        state.trial_delta = 0.0;
    }
}
