//! Two-body Jastrow factor with a Padé pair function.
//!
//! J(R) = exp(Σᵢ<ⱼ u(rᵢⱼ)),  u(r) = a r / (1 + b r)
//!
//! The cusp `a` is 1/2 for antiparallel and 1/4 for parallel spins. With `b = 1/F` this is the
//! `-F / (2(1 + r/F))` electron pair factor up to a constant shift, so
//! `PadeFunctor::from_cusp_param` keeps that parameterization available.

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::wavefunction::MoveRatio;

/// u(r) = a r / (1 + b r).
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct PadeFunctor {
    pub a: f64,
    pub b: f64,
}

impl PadeFunctor {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    /// Antiparallel-spin pair function from the cusp parameter F (b = 1/F).
    pub fn from_cusp_param(cusp_param: f64) -> Self {
        Self { a: 0.5, b: 1.0 / cusp_param }
    }

    /// Returns (u, du/dr, d²u/dr²).
    #[inline]
    pub fn evaluate(&self, r: f64) -> (f64, f64, f64) {
        let denom = 1.0 + self.b * r;
        let u = self.a * r / denom;
        let du = self.a / (denom * denom);
        let d2u = -2.0 * self.a * self.b / (denom * denom * denom);
        (u, du, d2u)
    }

    /// u(r), ∇ᵢ u(rᵢⱼ) and ∇ᵢ² u(rᵢⱼ) for displacement `dr = rᵢ - rⱼ`.
    #[inline]
    fn pair_terms(&self, dr: &Vector3<f64>) -> (f64, Vector3<f64>, f64) {
        let r = dr.norm().max(1e-12);
        let (u, du, d2u) = self.evaluate(r);
        (u, dr * (du / r), d2u + 2.0 * du / r)
    }
}

/// Spin-resolved two-body Jastrow over `n_particles` electrons, the first `n_up` spin up.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TwoBodyJastrow {
    pub n_particles: usize,
    pub n_up: usize,
    pub same_spin: PadeFunctor,
    pub opposite_spin: PadeFunctor,
}

/// Per-walker pair table for `TwoBodyJastrow`.
#[derive(Clone, Debug)]
pub struct JastrowState {
    u: DMatrix<f64>,
    /// ∇ᵢ u(rᵢⱼ), row-major over (i, j).
    du: Vec<Vector3<f64>>,
    d2u: DMatrix<f64>,
    grads: Vec<Vector3<f64>>,
    laps: Vec<f64>,
    log_value: f64,
    trial_u: Vec<f64>,
    trial_du: Vec<Vector3<f64>>,
    trial_d2u: Vec<f64>,
    trial_delta: f64,
}

impl JastrowState {
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

impl TwoBodyJastrow {
    /// Cusp-satisfying Jastrow with a common range parameter `b`.
    pub fn with_cusps(n_particles: usize, n_up: usize, b: f64) -> Self {
        Self {
            n_particles,
            n_up,
            same_spin: PadeFunctor::new(0.25, b),
            opposite_spin: PadeFunctor::new(0.5, b),
        }
    }

    fn functor(&self, i: usize, j: usize) -> &PadeFunctor {
        if (i < self.n_up) == (j < self.n_up) {
            &self.same_spin
        } else {
            &self.opposite_spin
        }
    }

    pub fn new_state(&self) -> JastrowState {
        let n = self.n_particles;
        JastrowState {
            u: DMatrix::zeros(n, n),
            du: vec![Vector3::zeros(); n * n],
            d2u: DMatrix::zeros(n, n),
            grads: vec![Vector3::zeros(); n],
            laps: vec![0.0; n],
            log_value: 0.0,
            trial_u: vec![0.0; n],
            trial_du: vec![Vector3::zeros(); n],
            trial_d2u: vec![0.0; n],
            trial_delta: 0.0,
        }
    }

    pub fn evaluate_log(&self, state: &mut JastrowState, positions: &[Vector3<f64>]) -> f64 {
        let n = self.n_particles;
        let mut log_value = 0.0;
        for i in 0..n {
            state.u[(i, i)] = 0.0;
            state.du[i * n + i] = Vector3::zeros();
            state.d2u[(i, i)] = 0.0;
            for j in (i + 1)..n {
                let dr = positions[i] - positions[j];
                let (u, du, d2u) = self.functor(i, j).pair_terms(&dr);
                log_value += u;
                state.u[(i, j)] = u;
                state.u[(j, i)] = u;
                state.du[i * n + j] = du;
                state.du[j * n + i] = -du;
                state.d2u[(i, j)] = d2u;
                state.d2u[(j, i)] = d2u;
            }
        }
        for i in 0..n {
            state.grads[i] = (0..n).map(|j| state.du[i * n + j]).sum();
            state.laps[i] = (0..n).map(|j| state.d2u[(i, j)]).sum();
        }
        state.log_value = log_value;
        log_value
    }

    pub fn ratio_grad(
        &self,
        state: &mut JastrowState,
        positions: &[Vector3<f64>],
        iat: usize,
        new_pos: &Vector3<f64>,
    ) -> MoveRatio {
        let n = self.n_particles;
        let mut delta = 0.0;
        let mut grad = Vector3::zeros();
        let mut lap = 0.0;
        for j in 0..n {
            if j == iat {
                state.trial_u[j] = 0.0;
                state.trial_du[j] = Vector3::zeros();
                state.trial_d2u[j] = 0.0;
                continue;
            }
            let dr = new_pos - positions[j];
            let (u, du, d2u) = self.functor(iat, j).pair_terms(&dr);
            delta += u - state.u[(iat, j)];
            grad += du;
            lap += d2u;
            state.trial_u[j] = u;
            state.trial_du[j] = du;
            state.trial_d2u[j] = d2u;
        }
        state.trial_delta = delta;
        MoveRatio { ratio: delta.exp(), grad, lap, singular: false }
    }

    pub fn accept_move(&self, state: &mut JastrowState, iat: usize) {
        let n = self.n_particles;
        for j in 0..n {
            if j == iat {
                continue;
            }
            // ∇ⱼ u(rⱼᵢ) = -∇ᵢ u(rᵢⱼ)
            state.grads[j] += state.du[iat * n + j] - state.trial_du[j];
            state.laps[j] += state.trial_d2u[j] - state.d2u[(iat, j)];
            state.u[(iat, j)] = state.trial_u[j];
            state.u[(j, iat)] = state.trial_u[j];
            state.du[iat * n + j] = state.trial_du[j];
            state.du[j * n + iat] = -state.trial_du[j];
            state.d2u[(iat, j)] = state.trial_d2u[j];
            state.d2u[(j, iat)] = state.trial_d2u[j];
        }
        state.grads[iat] = state.trial_du.iter().sum();
        state.laps[iat] = state.trial_d2u.iter().sum();
        state.log_value += state.trial_delta;
        state.trial_delta = 0.0;
    }

    pub fn restore(&self, state: &mut JastrowState, _iat: usize) {
        state.trial_delta = 0.0;
    }
}
