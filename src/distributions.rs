/*!
Example target densities with analytic gradients.

Each target implements [`HamiltonianTarget`] for `ndarray::Array1`, writing
its gradient in place. These are the distributions used throughout the
examples and tests; real models plug in through the same trait.

This module is generic over the floating-point precision (e.g. `f32` or
`f64`) using [`num_traits::Float`].
*/

use crate::hamiltonian::HamiltonianTarget;
use ndarray::{Array1, Array2, LinalgScalar};
use num_traits::Float;
use rand::distr::Distribution as RandDistribution;
use rand_distr::uniform::SampleUniform;
use rand_distr::StandardNormal;

/// Isotropic Gaussian with standard deviation `std` in every dimension,
/// centered at the origin. Works in any dimension.
#[derive(Clone, Debug)]
pub struct IsotropicGaussian<T> {
    pub std: T,
}

impl<T: Float> IsotropicGaussian<T> {
    pub fn new(std: T) -> Self {
        assert!(std > T::zero(), "standard deviation must be positive");
        Self { std }
    }
}

impl<T> HamiltonianTarget<Array1<T>> for IsotropicGaussian<T>
where
    T: Float + LinalgScalar + SampleUniform,
    StandardNormal: RandDistribution<T>,
{
    fn logp_and_grad(&self, position: &Array1<T>, grad: &mut Array1<T>) -> T {
        let inv_var = (self.std * self.std).recip();
        let mut logp = T::zero();
        for (g, &x) in grad.iter_mut().zip(position.iter()) {
            logp = logp - x * x * inv_var;
            *g = -x * inv_var;
        }
        logp * T::from(0.5).unwrap()
    }
}

/// A 2D Gaussian parameterized by a mean vector and a 2×2 covariance matrix.
#[derive(Clone, Debug)]
pub struct Gaussian2D<T> {
    pub mean: Array1<T>,
    pub cov: Array2<T>,
}

impl<T: Float> Gaussian2D<T> {
    /// Inverse of the 2×2 covariance.
    fn precision(&self) -> [[T; 2]; 2] {
        let (a, b) = (self.cov[[0, 0]], self.cov[[0, 1]]);
        let (c, d) = (self.cov[[1, 0]], self.cov[[1, 1]]);
        let det = a * d - b * c;
        assert!(
            det > T::zero(),
            "covariance matrix must be positive definite"
        );
        let inv_det = det.recip();
        [[d * inv_det, -b * inv_det], [-c * inv_det, a * inv_det]]
    }
}

impl<T> HamiltonianTarget<Array1<T>> for Gaussian2D<T>
where
    T: Float + LinalgScalar + SampleUniform,
    StandardNormal: RandDistribution<T>,
{
    fn logp_and_grad(&self, position: &Array1<T>, grad: &mut Array1<T>) -> T {
        let prec = self.precision();
        let dx = position[0] - self.mean[0];
        let dy = position[1] - self.mean[1];
        // grad logp = -Σ⁻¹ (x - μ)
        let gx = prec[0][0] * dx + prec[0][1] * dy;
        let gy = prec[1][0] * dx + prec[1][1] * dy;
        grad[0] = -gx;
        grad[1] = -gy;
        -(dx * gx + dy * gy) * T::from(0.5).unwrap()
    }
}

/// The 2D Rosenbrock density `logp = -((a - x)² + b (y - x²)²)`, a standard
/// curved, thin-ridged stress test for gradient-based samplers.
#[derive(Clone, Copy, Debug)]
pub struct Rosenbrock2D<T> {
    pub a: T,
    pub b: T,
}

impl<T> HamiltonianTarget<Array1<T>> for Rosenbrock2D<T>
where
    T: Float + LinalgScalar + SampleUniform,
    StandardNormal: RandDistribution<T>,
{
    fn logp_and_grad(&self, position: &Array1<T>, grad: &mut Array1<T>) -> T {
        let two = T::from(2.0).unwrap();
        let four = T::from(4.0).unwrap();
        let (x, y) = (position[0], position[1]);
        let residual = y - x * x;
        grad[0] = two * (self.a - x) + four * self.b * x * residual;
        grad[1] = -two * self.b * residual;
        let da = self.a - x;
        -(da * da + self.b * residual * residual)
    }
}

/// Checks an analytic gradient against central finite differences.
#[cfg(test)]
fn check_gradient<Target: HamiltonianTarget<Array1<f64>>>(
    target: &Target,
    position: &Array1<f64>,
    tol: f64,
) {
    let mut grad = Array1::zeros(position.len());
    let mut scratch = Array1::zeros(position.len());
    target.logp_and_grad(position, &mut grad);

    let h = 1e-6;
    for i in 0..position.len() {
        let mut plus = position.clone();
        plus[i] += h;
        let mut minus = position.clone();
        minus[i] -= h;
        let fd = (target.logp_and_grad(&plus, &mut scratch)
            - target.logp_and_grad(&minus, &mut scratch))
            / (2.0 * h);
        assert!(
            (grad[i] - fd).abs() < tol,
            "component {i}: analytic {} vs finite difference {fd}",
            grad[i]
        );
    }
}
