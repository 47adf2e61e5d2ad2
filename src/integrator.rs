//! Explicit leapfrog integrator.

use crate::euclidean::EuclideanVector;
use crate::hamiltonian::{EuclideanHamiltonian, HamiltonianTarget, PhaseState};
use num_traits::{Float, FromPrimitive};

/// Symplectic leapfrog integrator with a fixed base step size.
///
/// A single [`evolve`](Leapfrog::evolve) call advances one state by one step
/// of size `sign * step_size`. Calls on distinct states are independent and
/// may run concurrently; the same state must never be evolved from two
/// workers at once.
#[derive(Clone, Copy, Debug)]
pub struct Leapfrog<T> {
    step_size: T,
}

impl<T> Leapfrog<T>
where
    T: Float + FromPrimitive,
{
    /// # Panics
    /// Panics if `step_size` is not finite and positive.
    pub fn new(step_size: T) -> Self {
        assert!(
            step_size.is_finite() && step_size > T::zero(),
            "step size must be finite and positive"
        );
        Self { step_size }
    }

    pub fn step_size(&self) -> T {
        self.step_size
    }

    /// Advances `z` in place by one step of size `sign * step_size`.
    ///
    /// Half-kick, drift along the kinetic-energy gradient, gradient refresh,
    /// half-kick.
    pub fn evolve<V, Target>(
        &self,
        z: &mut PhaseState<V>,
        hamiltonian: &EuclideanHamiltonian<V, Target>,
        sign: T,
    ) where
        V: EuclideanVector<Scalar = T>,
        Target: HamiltonianTarget<V>,
    {
        let eps = sign * self.step_size;
        let half_eps = eps * T::from_f64(0.5).unwrap();

        z.momentum.add_scaled_assign(&z.potential_gradient, -half_eps);

        let mut velocity = z.momentum.zeros_like();
        hamiltonian.kinetic_gradient(z, &mut velocity);
        z.position.add_scaled_assign(&velocity, eps);

        hamiltonian.update_potential_gradient(z);
        z.momentum.add_scaled_assign(&z.potential_gradient, -half_eps);
    }
}
