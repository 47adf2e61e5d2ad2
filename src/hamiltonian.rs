//! Phase-space state and the Euclidean Hamiltonian over a diagonal metric.

use crate::euclidean::EuclideanVector;
use num_traits::{Float, FromPrimitive, One, Zero};
use rand::distr::Distribution as RandDistribution;
use rand::Rng;
use rand_distr::StandardNormal;

/// A target density that can write its gradient in-place for a given position.
pub trait HamiltonianTarget<V: EuclideanVector> {
    /// Returns the log-density at `position` and writes the gradient into `grad`.
    fn logp_and_grad(&self, position: &V, grad: &mut V) -> V::Scalar;
}

impl<V, T> HamiltonianTarget<V> for std::sync::Arc<T>
where
    V: EuclideanVector,
    T: HamiltonianTarget<V> + ?Sized,
{
    fn logp_and_grad(&self, position: &V, grad: &mut V) -> V::Scalar {
        self.as_ref().logp_and_grad(position, grad)
    }
}

/// One point in phase space: position, momentum, and the potential (negative
/// log-density) with its gradient at that position.
///
/// A `PhaseState` is mutated only by one integrator step at a time and is
/// otherwise copied, never shared between workers.
#[derive(Clone, Debug)]
pub struct PhaseState<V: EuclideanVector> {
    pub position: V,
    pub momentum: V,
    pub potential: V::Scalar,
    pub potential_gradient: V,
}

impl<V: EuclideanVector> PhaseState<V> {
    /// Creates a state at `position` with zeroed momentum, potential and
    /// gradient. Call [`EuclideanHamiltonian::init`] before integrating.
    pub fn new(position: V) -> Self {
        let momentum = position.zeros_like();
        let potential_gradient = position.zeros_like();
        Self {
            position,
            momentum,
            potential: V::Scalar::zero(),
            potential_gradient,
        }
    }

    /// Dimensionality of the underlying space.
    pub fn dim(&self) -> usize {
        self.position.len()
    }

    /// Copies `other` into `self` without reallocating.
    pub fn assign(&mut self, other: &Self) {
        self.position.assign(&other.position);
        self.momentum.assign(&other.momentum);
        self.potential = other.potential;
        self.potential_gradient.assign(&other.potential_gradient);
    }

    /// Log-density of the target at this position.
    pub fn log_density(&self) -> V::Scalar {
        -self.potential
    }
}

/// Euclidean Hamiltonian `H(q, p) = V(q) + ½ pᵀ M⁻¹ p` with a diagonal
/// inverse metric `M⁻¹`.
///
/// The kinetic-energy gradient `M⁻¹ p` doubles as the velocity in the
/// leapfrog drift and as the boundary vector of the generalized no-U-turn
/// criterion.
#[derive(Debug)]
pub struct EuclideanHamiltonian<V: EuclideanVector, Target> {
    target: Target,
    inv_metric: V,
    momentum_scale: V,
}

impl<V, Target> EuclideanHamiltonian<V, Target>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
{
    /// Creates a Hamiltonian with the given diagonal inverse metric.
    ///
    /// # Panics
    /// Panics if any metric component is not finite and positive.
    pub fn new(target: Target, inv_metric: V) -> Self {
        let mut components = vec![V::Scalar::zero(); inv_metric.len()];
        inv_metric.write_to_slice(&mut components);
        assert!(
            components
                .iter()
                .all(|m| m.is_finite() && *m > V::Scalar::zero()),
            "inverse metric components must be finite and positive"
        );

        // Momentum is drawn as N(0, M): scale a standard normal by 1/sqrt(M⁻¹).
        let mut momentum_scale = inv_metric.clone();
        momentum_scale.mapv_assign(|m| m.sqrt().recip());
        Self {
            target,
            inv_metric,
            momentum_scale,
        }
    }

    /// Creates a Hamiltonian with the unit metric, shaped like `template`.
    pub fn unit_metric(target: Target, template: &V) -> Self {
        let mut ones = template.zeros_like();
        ones.fill(V::Scalar::one());
        Self::new(target, ones)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn inv_metric(&self) -> &V {
        &self.inv_metric
    }

    /// Recomputes the potential and its gradient at the state's position.
    pub fn update_potential_gradient(&self, z: &mut PhaseState<V>) {
        let logp = self
            .target
            .logp_and_grad(&z.position, &mut z.potential_gradient);
        z.potential = -logp;
        z.potential_gradient.mapv_assign(|g| -g);
    }

    /// Prepares a freshly seeded state for integration.
    pub fn init(&self, z: &mut PhaseState<V>) {
        self.update_potential_gradient(z);
    }

    /// Draws a fresh momentum `p ~ N(0, M)` into the state.
    pub fn sample_momentum(&self, z: &mut PhaseState<V>, rng: &mut impl Rng)
    where
        StandardNormal: RandDistribution<V::Scalar>,
    {
        z.momentum.fill_standard_normal(rng);
        z.momentum.mul_elem_assign(&self.momentum_scale);
    }

    /// Total energy `H(q, p)` at the state.
    pub fn total_energy(&self, z: &PhaseState<V>) -> V::Scalar {
        let half = V::Scalar::from_f64(0.5).unwrap();
        let mut velocity = z.momentum.clone();
        velocity.mul_elem_assign(&self.inv_metric);
        z.potential + z.momentum.dot(&velocity) * half
    }

    /// Writes the kinetic-energy gradient `M⁻¹ p` into `out`.
    pub fn kinetic_gradient(&self, z: &PhaseState<V>, out: &mut V) {
        out.assign(&z.momentum);
        out.mul_elem_assign(&self.inv_metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array1};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    /// Standard normal target: logp = -½‖q‖², grad = -q.
    struct StdNormal;

    impl HamiltonianTarget<Array1<f64>> for StdNormal {
        fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
            grad.assign(&position.mapv(|x| -x));
            -0.5 * position.dot(position)
        }
    }

    #[test]
    fn total_energy_splits_into_potential_and_kinetic() {
        let ham = EuclideanHamiltonian::unit_metric(StdNormal, &arr1(&[0.0_f64, 0.0]));
        let mut z = PhaseState::new(arr1(&[1.0_f64, 2.0]));
        ham.init(&mut z);
        z.momentum = arr1(&[3.0, 4.0]);
        // V = 0.5*(1+4) = 2.5, T = 0.5*(9+16) = 12.5
        assert!((ham.total_energy(&z) - 15.0).abs() < 1e-12);
        assert!((z.log_density() - (-2.5)).abs() < 1e-12);
    }

    #[test]
    fn kinetic_gradient_applies_inverse_metric() {
        let ham = EuclideanHamiltonian::new(StdNormal, arr1(&[4.0_f64, 0.25]));
        let mut z = PhaseState::new(arr1(&[0.0_f64, 0.0]));
        z.momentum = arr1(&[1.0, 2.0]);
        let mut p_sharp = z.momentum.zeros_like();
        ham.kinetic_gradient(&z, &mut p_sharp);
        assert_eq!(p_sharp, arr1(&[4.0, 0.5]));
    }

    #[test]
    fn potential_gradient_points_uphill_in_potential() {
        let ham = EuclideanHamiltonian::unit_metric(StdNormal, &arr1(&[0.0_f64, 0.0]));
        let mut z = PhaseState::new(arr1(&[1.5_f64, -2.0]));
        ham.init(&mut z);
        // dV/dq = q for the standard normal.
        assert_eq!(z.potential_gradient, arr1(&[1.5, -2.0]));
        assert!((z.potential - 0.5 * (1.5 * 1.5 + 4.0)).abs() < 1e-12);
    }

    #[test]
    fn sampled_momentum_has_metric_scale() {
        // With inv_metric = 0.01, momenta are N(0, 100): spread must be wide.
        let ham = EuclideanHamiltonian::new(StdNormal, Array1::from_elem(256, 0.01_f64));
        let mut z = PhaseState::new(Array1::zeros(256));
        let mut rng = SmallRng::seed_from_u64(3);
        ham.sample_momentum(&mut z, &mut rng);
        let var = z.momentum.dot(&z.momentum) / 256.0;
        assert!(var > 50.0 && var < 200.0, "sample variance {var}");
    }
}
