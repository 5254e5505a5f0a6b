//! Orbital evaluator trait.
//!
//! `SingleWfn` is the only thing the determinant machinery asks of a basis: the value, gradient
//! and Laplacian of one single-particle orbital at a point. How the orbital is built (splines,
//! Gaussians, Slater functions) stays behind this trait.

use nalgebra::Vector3;

/// Single-center wavefunction trait (e.g., atomic orbitals).
pub trait SingleWfn {
    /// Evaluate the orbital at position `r`.
    fn evaluate(&self, r: &Vector3<f64>) -> f64;

    /// Compute the gradient at position `r`.
    fn derivative(&self, r: &Vector3<f64>) -> Vector3<f64>;

    /// Compute the Laplacian at position `r`.
    fn laplacian(&self, r: &Vector3<f64>) -> f64;

    /// Value, gradient and Laplacian in one call.
    fn vgl(&self, r: &Vector3<f64>) -> (f64, Vector3<f64>, f64) {
        (self.evaluate(r), self.derivative(r), self.laplacian(r))
    }

    /// Numerical gradient using central difference.
    fn numerical_derivative(&self, r: &Vector3<f64>, h: f64) -> Vector3<f64> {
        let mut grad = Vector3::zeros();
        for axis in 0..3 {
            let mut r_fwd = *r;
            let mut r_bwd = *r;
            r_fwd[axis] += h;
            r_bwd[axis] -= h;
            grad[axis] = (self.evaluate(&r_fwd) - self.evaluate(&r_bwd)) / (2.0 * h);
        }
        grad
    }

    /// Numerical Laplacian using central difference.
    fn numerical_laplacian(&self, r: &Vector3<f64>, h: f64) -> f64 {
        let psi = self.evaluate(r);
        let mut laplacian = 0.0;
        for axis in 0..3 {
            let mut r_fwd = *r;
            let mut r_bwd = *r;
            r_fwd[axis] += h;
            r_bwd[axis] -= h;
            laplacian += (self.evaluate(&r_fwd) - 2.0 * psi + self.evaluate(&r_bwd)) / (h * h);
        }
        laplacian
    }
}

/// Boxed orbital shared read-only by every walker.
pub type OrbitalBox = Box<dyn SingleWfn + Send + Sync>;
