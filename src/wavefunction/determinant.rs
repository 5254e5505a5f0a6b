//! Slater determinants kept implicitly through their inverse.
//!
//! The matrix convention is `A[(i, j)] = φ_j(r_i)`: rows are particles, columns are orbitals.
//! Moving particle `i` replaces row `i`, so the ratio of new to old determinant is the dot
//! product of the new row with column `i` of `A⁻¹`, and the inverse is patched in O(N²) with a
//! Sherman-Morrison update.
//!
//! Reference: Ceperley, Chester, Kalos, Phys. Rev. B 16, 3081 (1977); Fahy, Wang, Louie,
//! Phys. Rev. B 42, 3503 (1990).

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::{QmcError, Result};
use super::traits::OrbitalBox;
use super::trial::MoveRatio;

/// Inverse-matrix bookkeeping for one determinant.
///
/// Holds `A`, `A⁻¹`, `ln|det A|` and the sign of `det A`. The sign is reported as a phase
/// (0 or π) because the trial functions are real.
#[derive(Clone, Debug)]
pub struct DeterminantUpdater {
    a: DMatrix<f64>,
    a_inv: DMatrix<f64>,
    log_value: f64,
    sign: f64,
    singular_floor: f64,
    updates: usize,
    work: DVector<f64>,
}

impl DeterminantUpdater {
    /// Identity matrix of dimension `n`.
    pub fn new(n: usize, singular_floor: f64) -> Self {
        Self {
            a: DMatrix::identity(n, n),
            a_inv: DMatrix::identity(n, n),
            log_value: 0.0,
            sign: 1.0,
            singular_floor,
            updates: 0,
            work: DVector::zeros(n),
        }
    }

    /// Build from an explicit matrix and invert it.
    pub fn from_matrix(a: DMatrix<f64>, singular_floor: f64) -> Result<Self> {
        if !a.is_square() {
            return Err(QmcError::Config(format!(
                "determinant matrix must be square, got {}x{}",
                a.nrows(),
                a.ncols()
            )));
        }
        let n = a.nrows();
        let mut updater = Self::new(n, singular_floor);
        updater.a = a;
        updater.full_recompute()?;
        Ok(updater)
    }

    pub fn dim(&self) -> usize {
        self.a.nrows()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn inverse(&self) -> &DMatrix<f64> {
        &self.a_inv
    }

    /// ln|det A|.
    pub fn log_value(&self) -> f64 {
        self.log_value
    }

    /// Phase of det A: 0 for positive, π for negative.
    pub fn phase(&self) -> f64 {
        if self.sign < 0.0 {
            PI
        } else {
            0.0
        }
    }

    pub fn singular_floor(&self) -> f64 {
        self.singular_floor
    }

    /// Rank-1 updates applied since the last full recompute.
    pub fn updates_since_recompute(&self) -> usize {
        self.updates
    }

    /// Overwrite row `row` of `A` without touching the inverse. Call `full_recompute` afterwards.
    pub fn set_row(&mut self, row: usize, values: &[f64]) {
        for (j, &v) in values.iter().enumerate() {
            self.a[(row, j)] = v;
        }
    }

    /// det(A') / det(A) where A' has row `row` replaced by `new_row`.
    ///
    /// Does not touch the inverse.
    pub fn ratio(&self, row: usize, new_row: &[f64]) -> f64 {
        debug_assert_eq!(new_row.len(), self.dim());
        new_row
            .iter()
            .enumerate()
            .map(|(j, &u)| u * self.a_inv[(j, row)])
            .sum()
    }

    /// Whether a ratio is too small to update with.
    pub fn is_singular(&self, ratio: f64) -> bool {
        !ratio.is_finite() || ratio.abs() < self.singular_floor
    }

    /// Commit the replacement of row `row` by `new_row`, whose ratio was computed by `ratio`.
    ///
    /// Leaves everything untouched and returns `SingularUpdate` when the ratio is under the
    /// floor.
    pub fn accept_update(&mut self, row: usize, new_row: &[f64], ratio: f64) -> Result<()> {
        if self.is_singular(ratio) {
            return Err(QmcError::SingularUpdate { ratio });
        }
        let n = self.dim();
        let inv_ratio = 1.0 / ratio;

        // work_k = Σ_j u_j A⁻¹[j, k]; work_row equals the ratio.
        for k in 0..n {
            self.work[k] = (0..n).map(|j| new_row[j] * self.a_inv[(j, k)]).sum();
        }
        let col: DVector<f64> = self.a_inv.column(row).clone_owned();
        for k in 0..n {
            let w = if k == row { self.work[k] - 1.0 } else { self.work[k] };
            if w == 0.0 {
                continue;
            }
            let scale = w * inv_ratio;
            for j in 0..n {
                self.a_inv[(j, k)] -= col[j] * scale;
            }
        }

        self.set_row(row, new_row);
        self.log_value += ratio.abs().ln();
        if ratio < 0.0 {
            self.sign = -self.sign;
        }
        self.updates += 1;
        Ok(())
    }

    /// Rejection path. Nothing was written before acceptance, so there is nothing to undo.
    pub fn restore(&mut self) {}

    /// O(N³) LU re-inversion of the stored matrix; returns `(ln|det|, phase)`.
    pub fn full_recompute(&mut self) -> Result<(f64, f64)> {
        let n = self.dim();
        if n == 0 {
            self.log_value = 0.0;
            self.sign = 1.0;
            self.updates = 0;
            return Ok((0.0, 0.0));
        }
        let lu = self.a.clone().lu();
        let u = lu.u();
        let mut log_value = 0.0;
        let mut sign: f64 = lu.p().determinant();
        for i in 0..n {
            let d = u[(i, i)];
            if d == 0.0 || !d.is_finite() {
                return Err(QmcError::Singular(format!(
                    "zero pivot at row {i} of {n}x{n} determinant"
                )));
            }
            log_value += d.abs().ln();
            if d < 0.0 {
                sign = -sign;
            }
        }
        let a_inv = lu
            .try_inverse()
            .ok_or_else(|| QmcError::Singular(format!("{n}x{n} determinant not invertible")))?;
        self.a_inv = a_inv;
        self.log_value = log_value;
        self.sign = sign;
        self.updates = 0;
        Ok((self.log_value, self.phase()))
    }
}

/// One spin block of a Slater determinant acting on particles `first..first + n`.
pub struct DiracDeterminant {
    pub orbitals: Vec<OrbitalBox>,
    pub first: usize,
    pub singular_floor: f64,
}

/// Per-walker cache for a `DiracDeterminant`.
#[derive(Clone, Debug)]
pub struct DeterminantState {
    pub updater: DeterminantUpdater,
    /// ∇φ_j(r_i), row-major over (i, j).
    grad_m: Vec<Vector3<f64>>,
    /// ∇²φ_j(r_i), row-major over (i, j).
    lap_m: Vec<f64>,
    /// ∇_i ln D per local particle.
    grads: Vec<Vector3<f64>>,
    /// ∇²_i ln D per local particle.
    laps: Vec<f64>,
    trial_row: Vec<f64>,
    trial_grad: Vec<Vector3<f64>>,
    trial_lap: Vec<f64>,
    trial_ratio: f64,
}

impl DeterminantState {
    pub fn grad(&self, local: usize) -> Vector3<f64> {
        self.grads[local]
    }

    pub fn lap(&self, local: usize) -> f64 {
        self.laps[local]
    }
}

impl DiracDeterminant {
    pub fn new(orbitals: Vec<OrbitalBox>, first: usize, singular_floor: f64) -> Self {
        Self { orbitals, first, singular_floor }
    }

    /// Number of particles (and orbitals) in this block.
    pub fn size(&self) -> usize {
        self.orbitals.len()
    }

    pub fn contains(&self, iat: usize) -> bool {
        iat >= self.first && iat < self.first + self.size()
    }

    pub fn new_state(&self) -> DeterminantState {
        let n = self.size();
        DeterminantState {
            updater: DeterminantUpdater::new(n, self.singular_floor),
            grad_m: vec![Vector3::zeros(); n * n],
            lap_m: vec![0.0; n * n],
            grads: vec![Vector3::zeros(); n],
            laps: vec![0.0; n],
            trial_row: vec![0.0; n],
            trial_grad: vec![Vector3::zeros(); n],
            trial_lap: vec![0.0; n],
            trial_ratio: 1.0,
        }
    }

    /// Fill every row from `positions` and re-invert from scratch.
    pub fn evaluate_log(
        &self,
        state: &mut DeterminantState,
        positions: &[Vector3<f64>],
    ) -> Result<(f64, f64)> {
        let n = self.size();
        let mut row = vec![0.0; n];
        for i in 0..n {
            let r = &positions[self.first + i];
            for (j, orb) in self.orbitals.iter().enumerate() {
                let (v, g, l) = orb.vgl(r);
                row[j] = v;
                state.grad_m[i * n + j] = g;
                state.lap_m[i * n + j] = l;
            }
            state.updater.set_row(i, &row);
        }
        let (log_value, phase) = state.updater.full_recompute()?;
        self.refresh_derivatives(state);
        Ok((log_value, phase))
    }

    fn refresh_derivatives(&self, state: &mut DeterminantState) {
        let n = self.size();
        let a_inv = state.updater.inverse();
        for i in 0..n {
            let mut g = Vector3::zeros();
            let mut l = 0.0;
            for j in 0..n {
                let c = a_inv[(j, i)];
                g += state.grad_m[i * n + j] * c;
                l += state.lap_m[i * n + j] * c;
            }
            state.grads[i] = g;
            state.laps[i] = l - g.norm_squared();
        }
    }

    /// Ratio and new-position derivatives of ln D for moving particle `iat` to `new_pos`.
    ///
    /// Fills the trial buffers; nothing else in the state changes.
    pub fn ratio_grad(
        &self,
        state: &mut DeterminantState,
        iat: usize,
        new_pos: &Vector3<f64>,
    ) -> MoveRatio {
        if !self.contains(iat) {
            return MoveRatio::unity();
        }
        let i = iat - self.first;
        for (j, orb) in self.orbitals.iter().enumerate() {
            let (v, g, l) = orb.vgl(new_pos);
            state.trial_row[j] = v;
            state.trial_grad[j] = g;
            state.trial_lap[j] = l;
        }
        let ratio = state.updater.ratio(i, &state.trial_row);
        state.trial_ratio = ratio;
        if state.updater.is_singular(ratio) {
            return MoveRatio { ratio, grad: Vector3::zeros(), lap: 0.0, singular: true };
        }
        let a_inv = state.updater.inverse();
        let mut g = Vector3::zeros();
        let mut l = 0.0;
        for j in 0..self.size() {
            let c = a_inv[(j, i)];
            g += state.trial_grad[j] * c;
            l += state.trial_lap[j] * c;
        }
        g /= ratio;
        l /= ratio;
        MoveRatio { ratio, grad: g, lap: l - g.norm_squared(), singular: false }
    }

    /// Promote the trial row computed by the last `ratio_grad` for `iat`.
    pub fn accept_move(&self, state: &mut DeterminantState, iat: usize) -> Result<()> {
        if !self.contains(iat) {
            return Ok(());
        }
        let n = self.size();
        let i = iat - self.first;
        let ratio = state.trial_ratio;
        state.updater.accept_update(i, &state.trial_row, ratio)?;
        for j in 0..n {
            state.grad_m[i * n + j] = state.trial_grad[j];
            state.lap_m[i * n + j] = state.trial_lap[j];
        }
        self.refresh_derivatives(state);
        Ok(())
    }

    pub fn restore(&self, state: &mut DeterminantState, iat: usize) {
        if self.contains(iat) {
            state.updater.restore();
            state.trial_ratio = 1.0;
        }
    }
}
