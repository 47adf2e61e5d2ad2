//! Static-trajectory Hamiltonian Monte Carlo.
//!
//! The plain fixed-length counterpart of the No-U-Turn samplers in this
//! crate: a fresh momentum, a fixed number of leapfrog steps, and one
//! Metropolis accept/reject of the endpoint. Shares the phase-space,
//! Hamiltonian and integrator core with the trajectory builders and runs
//! through [`crate::core::ChainRunner`].

use crate::core::MarkovChain;
use crate::euclidean::EuclideanVector;
use crate::hamiltonian::{EuclideanHamiltonian, HamiltonianTarget, PhaseState};
use crate::integrator::Leapfrog;
use num_traits::{Float, FromPrimitive, One, Zero};
use rand::distr::Distribution as RandDistribution;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{StandardNormal, StandardUniform};

/// A single HMC chain.
pub struct HmcChain<V, Target>
where
    V: EuclideanVector,
    Target: HamiltonianTarget<V>,
{
    hamiltonian: EuclideanHamiltonian<V, Target>,
    integrator: Leapfrog<V::Scalar>,
    n_leapfrog: usize,
    z: PhaseState<V>,
    proposal: PhaseState<V>,
    rng: SmallRng,
    state_buf: Vec<V::Scalar>,
}

impl<V, Target> HmcChain<V, Target>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    StandardNormal: RandDistribution<V::Scalar>,
    StandardUniform: RandDistribution<V::Scalar>,
{
    /// Creates a chain with the unit metric.
    pub fn new(target: Target, initial_position: V, step_size: V::Scalar, n_leapfrog: usize) -> Self {
        let hamiltonian = EuclideanHamiltonian::unit_metric(target, &initial_position);
        Self::with_hamiltonian(hamiltonian, initial_position, step_size, n_leapfrog)
    }

    /// Creates a chain with a diagonal inverse metric.
    pub fn with_metric(
        target: Target,
        inv_metric: V,
        initial_position: V,
        step_size: V::Scalar,
        n_leapfrog: usize,
    ) -> Self {
        let hamiltonian = EuclideanHamiltonian::new(target, inv_metric);
        Self::with_hamiltonian(hamiltonian, initial_position, step_size, n_leapfrog)
    }

    fn with_hamiltonian(
        hamiltonian: EuclideanHamiltonian<V, Target>,
        initial_position: V,
        step_size: V::Scalar,
        n_leapfrog: usize,
    ) -> Self {
        assert!(n_leapfrog > 0, "n_leapfrog must be positive");
        let mut z = PhaseState::new(initial_position);
        hamiltonian.init(&mut z);
        let proposal = z.clone();
        let mut thread_rng = rand::rng();
        let rng = SmallRng::from_rng(&mut thread_rng);
        let mut state_buf = vec![V::Scalar::zero(); z.dim()];
        z.position.write_to_slice(&mut state_buf);
        Self {
            hamiltonian,
            integrator: Leapfrog::new(step_size),
            n_leapfrog,
            z,
            proposal,
            rng,
            state_buf,
        }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn position(&self) -> &V {
        &self.z.position
    }
}

impl<V, Target> MarkovChain<V::Scalar> for HmcChain<V, Target>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    StandardNormal: RandDistribution<V::Scalar>,
    StandardUniform: RandDistribution<V::Scalar>,
{
    fn step(&mut self) -> &[V::Scalar] {
        self.hamiltonian.sample_momentum(&mut self.z, &mut self.rng);
        let h0 = self.hamiltonian.total_energy(&self.z);

        self.proposal.assign(&self.z);
        let one = V::Scalar::one();
        for _ in 0..self.n_leapfrog {
            self.integrator.evolve(&mut self.proposal, &self.hamiltonian, one);
        }

        let mut h = self.hamiltonian.total_energy(&self.proposal);
        if h.is_nan() {
            h = V::Scalar::infinity();
        }

        let log_accept = h0 - h;
        let u: V::Scalar = self.rng.random();
        if u.ln() <= log_accept {
            self.z.assign(&self.proposal);
        }

        self.z.position.write_to_slice(&mut self.state_buf);
        &self.state_buf
    }

    fn current_state(&self) -> &[V::Scalar] {
        &self.state_buf
    }
}

/// Multiple independent HMC chains, run through [`crate::core::ChainRunner`].
pub struct HmcSampler<V, Target>
where
    V: EuclideanVector,
    Target: HamiltonianTarget<V>,
{
    pub chains: Vec<HmcChain<V, Target>>,
}

impl<V, Target> HmcSampler<V, Target>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V> + Clone,
    StandardNormal: RandDistribution<V::Scalar>,
    StandardUniform: RandDistribution<V::Scalar>,
{
    pub fn new(
        target: Target,
        initial_positions: Vec<V>,
        step_size: V::Scalar,
        n_leapfrog: usize,
    ) -> Self {
        assert!(
            !initial_positions.is_empty(),
            "initial_positions must not be empty"
        );
        let chains = initial_positions
            .into_iter()
            .map(|pos| HmcChain::new(target.clone(), pos, step_size, n_leapfrog))
            .collect();
        Self { chains }
    }

    /// Seeds each chain with `seed + i + 1`, where `i` is the chain index.
    pub fn set_seed(mut self, seed: u64) -> Self {
        for (i, chain) in self.chains.iter_mut().enumerate() {
            chain.rng = SmallRng::seed_from_u64(seed + i as u64 + 1);
        }
        self
    }
}

impl<V, Target> crate::core::HasChains<V::Scalar> for HmcSampler<V, Target>
where
    V: EuclideanVector + Send,
    V::Scalar: Float + FromPrimitive + Send,
    Target: HamiltonianTarget<V> + Send,
    StandardNormal: RandDistribution<V::Scalar>,
    StandardUniform: RandDistribution<V::Scalar>,
{
    type Chain = HmcChain<V, Target>;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain> {
        &mut self.chains
    }
}
