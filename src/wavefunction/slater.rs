//! Concrete single-particle orbitals used by the bundled systems.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use super::traits::SingleWfn;

/// Slater 1s orbital centered at position `center` with exponent `alpha`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Slater1s {
    /// Orbital exponent
    pub alpha: f64,
    /// Center position of the orbital
    pub center: Vector3<f64>,
}

impl SingleWfn for Slater1s {
    fn evaluate(&self, r: &Vector3<f64>) -> f64 {
        let dr = r - self.center;
        (-self.alpha * dr.norm()).exp()
    }

    fn derivative(&self, r: &Vector3<f64>) -> Vector3<f64> {
        let dr = r - self.center;
        let r_norm = dr.norm();
        if r_norm == 0.0 {
            return Vector3::zeros();
        }
        let scalar = -self.alpha / r_norm * (-self.alpha * r_norm).exp();
        dr * scalar
    }

    fn laplacian(&self, r: &Vector3<f64>) -> f64 {
        let dr = r - self.center;
        // The cusp makes the Laplacian singular at the nucleus; clamp the radius so a walker
        // sitting exactly on it still gets a finite (very negative) kinetic term.
        let r_norm = dr.norm().max(1e-12);
        let exp_part = (-self.alpha * r_norm).exp();
        (self.alpha.powi(2) - 2.0 * self.alpha / r_norm) * exp_part
    }

    fn vgl(&self, r: &Vector3<f64>) -> (f64, Vector3<f64>, f64) {
        let dr = r - self.center;
        let r_norm = dr.norm();
        let value = (-self.alpha * r_norm).exp();
        if r_norm == 0.0 {
            return (value, Vector3::zeros(), self.laplacian(r));
        }
        let grad = dr * (-self.alpha / r_norm * value);
        let lap = (self.alpha.powi(2) - 2.0 * self.alpha / r_norm) * value;
        (value, grad, lap)
    }
}

/// Gaussian orbital exp(-α/2 Σ_{d<dims} (x_d - c_d)²).
///
/// Only the first `dims` Cartesian components enter, which lets a 3-vector walker represent a
/// particle in one or two dimensions: the remaining coordinates are flat directions of the
/// orbital.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GaussianOrbital {
    pub alpha: f64,
    pub center: Vector3<f64>,
    pub dims: usize,
}

impl GaussianOrbital {
    pub fn new(alpha: f64, center: Vector3<f64>, dims: usize) -> Self {
        Self {
            alpha,
            center,
            dims: dims.clamp(1, 3),
        }
    }

    fn masked(&self, r: &Vector3<f64>) -> Vector3<f64> {
        let mut dr = r - self.center;
        for d in self.dims..3 {
            dr[d] = 0.0;
        }
        dr
    }
}

impl SingleWfn for GaussianOrbital {
    fn evaluate(&self, r: &Vector3<f64>) -> f64 {
        let dr = self.masked(r);
        (-0.5 * self.alpha * dr.norm_squared()).exp()
    }

    fn derivative(&self, r: &Vector3<f64>) -> Vector3<f64> {
        let dr = self.masked(r);
        -self.alpha * self.evaluate(r) * dr
    }

    fn laplacian(&self, r: &Vector3<f64>) -> f64 {
        let dr = self.masked(r);
        let a = self.alpha;
        (a * a * dr.norm_squared() - a * self.dims as f64) * self.evaluate(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_slater1s_numerical_derivative_and_laplacian() {
        let orb = Slater1s { alpha: 1.3, center: Vector3::new(0.1, -0.2, 0.3) };
        let r = Vector3::new(0.7, 0.4, -0.5);
        let h = 1e-5;

        let grad = orb.derivative(&r);
        let num_grad = orb.numerical_derivative(&r, h);
        for axis in 0..3 {
            assert_relative_eq!(grad[axis], num_grad[axis], epsilon = 1e-6);
        }
        assert_relative_eq!(orb.laplacian(&r), orb.numerical_laplacian(&r, h), epsilon = 1e-4);

        let (v, g, l) = orb.vgl(&r);
        assert_relative_eq!(v, orb.evaluate(&r), epsilon = 1e-14);
        assert_relative_eq!((g - grad).norm(), 0.0, epsilon = 1e-14);
        assert_relative_eq!(l, orb.laplacian(&r), epsilon = 1e-12);
    }

    #[test]
    fn test_gaussian_numerical_derivative_and_laplacian() {
        for dims in 1..=3 {
            let orb = GaussianOrbital::new(0.8, Vector3::new(0.2, 0.0, -0.1), dims);
            let r = Vector3::new(-0.4, 0.9, 0.3);
            let h = 1e-5;
            let grad = orb.derivative(&r);
            let num_grad = orb.numerical_derivative(&r, h);
            for axis in 0..3 {
                assert_relative_eq!(grad[axis], num_grad[axis], epsilon = 1e-6);
            }
            assert_relative_eq!(orb.laplacian(&r), orb.numerical_laplacian(&r, h), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_gaussian_ignores_masked_axes() {
        let orb = GaussianOrbital::new(1.0, Vector3::zeros(), 1);
        let a = orb.evaluate(&Vector3::new(0.5, 0.0, 0.0));
        let b = orb.evaluate(&Vector3::new(0.5, 3.0, -7.0));
        assert_relative_eq!(a, b, epsilon = 1e-15);
        assert_eq!(orb.derivative(&Vector3::new(0.5, 3.0, -7.0)).y, 0.0);
    }
}
