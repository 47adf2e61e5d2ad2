//! No-U-Turn transition drivers.
//!
//! One transition grows a doubling trajectory from the current point and
//! returns a multinomially selected sample together with its diagnostics.
//! The growth loop is expressed once, as a commit rule over extension
//! outcomes ([`TransitionCore`]), and consumed by two interchangeable
//! drivers: the sequential loop in this module and the speculative
//! task-graph scheduler in [`crate::parallel`].

use crate::euclidean::EuclideanVector;
use crate::hamiltonian::{EuclideanHamiltonian, HamiltonianTarget, PhaseState};
use crate::integrator::Leapfrog;
use crate::math::log_sum_exp;
use crate::tree::{compute_criterion, extend_tree, ExtendOutcome, Subtree, TrajectoryStatus, TreeContext};
use num_traits::{Float, FromPrimitive, One, Zero};
use rand::distr::Distribution as RandDistribution;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{StandardNormal, StandardUniform};

/// Trajectory-growth limits, consumed by both drivers.
#[derive(Clone, Copy, Debug)]
pub struct NutsOptions<T> {
    /// Maximum number of doublings per transition. Must be positive.
    pub max_depth: usize,
    /// Energy error above which a leapfrog step is declared divergent.
    pub max_delta_energy: T,
}

impl<T> Default for NutsOptions<T>
where
    T: Float + FromPrimitive,
{
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_delta_energy: T::from_f64(1000.0).unwrap(),
        }
    }
}

/// The point handed back to the calling sampler loop.
#[derive(Clone, Debug)]
pub struct Sample<V: EuclideanVector> {
    pub position: V,
    pub log_density: V::Scalar,
    /// Average Metropolis probability across the whole trajectory, including
    /// subtrees that were ultimately rejected.
    pub accept_prob: V::Scalar,
}

/// One transition's sample plus its diagnostics.
#[derive(Clone, Debug)]
pub struct Transition<V: EuclideanVector> {
    pub sample: Sample<V>,
    /// Doublings committed before stopping.
    pub depth: usize,
    /// Leapfrog steps spent on the committed trajectory.
    pub n_leapfrog: usize,
    /// Whether a committed extension contained a divergent leaf.
    pub divergent: bool,
    /// Total energy at the selected point.
    pub energy: V::Scalar,
    pub(crate) log_sum_weight: V::Scalar,
}

/// Strategy for growing one trajectory and sampling a point from it.
///
/// `transition` advances `z` in place to the selected point. Implementations
/// must produce statistically identical trajectories; they differ only in
/// how the doublings are scheduled.
pub trait TrajectoryDriver<V, Target>
where
    V: EuclideanVector,
    Target: HamiltonianTarget<V>,
{
    fn transition(
        &mut self,
        z: &mut PhaseState<V>,
        hamiltonian: &EuclideanHamiltonian<V, Target>,
        integrator: &Leapfrog<V::Scalar>,
        opts: &NutsOptions<V::Scalar>,
    ) -> Transition<V>;

    /// Re-seeds every random stream owned by the driver.
    fn reseed(&mut self, seed: u64);
}

/// Trajectory-wide accumulators, mutated only by whoever commits extensions
/// in logical order: the sequential loop below, or the check chain of the
/// speculative scheduler.
pub(crate) struct TransitionCore<V: EuclideanVector> {
    pub(crate) depth: usize,
    pub(crate) rho: V,
    pub(crate) log_sum_weight: V::Scalar,
    pub(crate) sample: PhaseState<V>,
    pub(crate) p_sharp_fwd: V,
    pub(crate) p_sharp_bck: V,
    pub(crate) n_leapfrog: usize,
    pub(crate) sum_metro_prob: V::Scalar,
    pub(crate) divergent: bool,
}

impl<V> TransitionCore<V>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
{
    pub(crate) fn new(z: &PhaseState<V>, p_sharp: &V) -> Self {
        Self {
            depth: 0,
            rho: z.momentum.clone(),
            log_sum_weight: V::Scalar::zero(),
            sample: z.clone(),
            p_sharp_fwd: p_sharp.clone(),
            p_sharp_bck: p_sharp.clone(),
            n_leapfrog: 0,
            sum_metro_prob: V::Scalar::zero(),
            divergent: false,
        }
    }

    /// Folds one extension into the trajectory. Returns whether growth may
    /// continue: false on an invalid extension or a failed criterion.
    ///
    /// Leapfrog and Metropolis totals always include the extension this is
    /// called on — also the one the trajectory stops on — matching the
    /// convention that the acceptance statistic averages over rejected
    /// subtrees as well.
    pub(crate) fn commit(
        &mut self,
        outcome: &ExtendOutcome<V>,
        forward: bool,
        rng: &mut SmallRng,
    ) -> bool
    where
        StandardUniform: RandDistribution<V::Scalar>,
    {
        self.n_leapfrog += outcome.leapfrog_count;
        self.sum_metro_prob = self.sum_metro_prob + outcome.metro_prob_sum;

        if !outcome.valid {
            self.divergent = self.divergent || outcome.divergent;
            return false;
        }

        self.depth += 1;

        // Biased coin against the running total; the comparison uses the
        // weight before the new subtree is folded in.
        if outcome.log_sum_weight > self.log_sum_weight {
            self.sample.assign(&outcome.proposal);
        } else {
            let accept_prob = (outcome.log_sum_weight - self.log_sum_weight).exp();
            let u: V::Scalar = rng.random();
            if u < accept_prob {
                self.sample.assign(&outcome.proposal);
            }
        }

        self.log_sum_weight = log_sum_exp(self.log_sum_weight, outcome.log_sum_weight);
        self.rho.add_assign(&outcome.rho);

        if forward {
            self.p_sharp_fwd.assign(&outcome.boundary_gradient);
        } else {
            self.p_sharp_bck.assign(&outcome.boundary_gradient);
        }

        compute_criterion(&self.p_sharp_bck, &self.p_sharp_fwd, &self.rho)
    }

    /// Finalizes the transition: writes the selected point into `z` and
    /// derives the acceptance statistic.
    pub(crate) fn into_transition<Target>(
        self,
        z: &mut PhaseState<V>,
        hamiltonian: &EuclideanHamiltonian<V, Target>,
    ) -> Transition<V>
    where
        Target: HamiltonianTarget<V>,
    {
        z.assign(&self.sample);
        let energy = hamiltonian.total_energy(z);
        let denom = V::Scalar::from_usize(self.n_leapfrog.max(1)).unwrap();
        let accept_prob = self.sum_metro_prob / denom;
        Transition {
            sample: Sample {
                position: z.position.clone(),
                log_density: z.log_density(),
                accept_prob,
            },
            depth: self.depth,
            n_leapfrog: self.n_leapfrog,
            divergent: self.divergent,
            energy,
            log_sum_weight: self.log_sum_weight,
        }
    }
}

/// Sequential driver: alternates growing the forward and backward subtree,
/// one doubling at a time, committing after each extension.
#[derive(Debug)]
pub struct SerialDriver {
    rng: SmallRng,
    coins: SmallRng,
}

impl SerialDriver {
    pub fn new() -> Self {
        let mut thread_rng = rand::rng();
        let rng = SmallRng::from_rng(&mut thread_rng);
        let coins = SmallRng::from_rng(&mut thread_rng);
        Self { rng, coins }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.reseed_streams(seed);
        self
    }

    /// Runs one transition with a fixed direction plan instead of drawing
    /// directions on the fly. Shared with the speculative driver's tests.
    #[allow(dead_code)]
    pub(crate) fn transition_with_plan<V, Target>(
        &mut self,
        z: &mut PhaseState<V>,
        hamiltonian: &EuclideanHamiltonian<V, Target>,
        integrator: &Leapfrog<V::Scalar>,
        opts: &NutsOptions<V::Scalar>,
        plan: &[bool],
    ) -> Transition<V>
    where
        V: EuclideanVector,
        V::Scalar: Float + FromPrimitive,
        Target: HamiltonianTarget<V>,
        StandardNormal: RandDistribution<V::Scalar>,
        StandardUniform: RandDistribution<V::Scalar>,
    {
        hamiltonian.sample_momentum(z, &mut self.rng);
        hamiltonian.init(z);
        self.grow(z, hamiltonian, integrator, opts, Some(plan))
    }

    fn grow<V, Target>(
        &mut self,
        z: &mut PhaseState<V>,
        hamiltonian: &EuclideanHamiltonian<V, Target>,
        integrator: &Leapfrog<V::Scalar>,
        opts: &NutsOptions<V::Scalar>,
        plan: Option<&[bool]>,
    ) -> Transition<V>
    where
        V: EuclideanVector,
        V::Scalar: Float + FromPrimitive,
        Target: HamiltonianTarget<V>,
        StandardUniform: RandDistribution<V::Scalar>,
    {
        let h0 = hamiltonian.total_energy(z);
        let mut p_sharp = z.momentum.zeros_like();
        hamiltonian.kinetic_gradient(z, &mut p_sharp);

        let status = TrajectoryStatus::new();
        let mut core = TransitionCore::new(z, &p_sharp);
        let one = V::Scalar::one();
        let mut tree_fwd = Subtree::new(one, z, &p_sharp);
        let mut tree_bck = Subtree::new(-one, z, &p_sharp);

        let ctx = TreeContext {
            hamiltonian,
            integrator,
            opts,
            status: &status,
            h0,
        };

        let half = V::Scalar::from_f64(0.5).unwrap();
        while core.depth < opts.max_depth {
            let forward = match plan {
                Some(plan) => plan[core.depth],
                None => {
                    let u: V::Scalar = self.rng.random();
                    u > half
                }
            };

            let outcome = if forward {
                extend_tree(core.depth, &mut tree_fwd, z, &ctx, &mut self.coins)
            } else {
                extend_tree(core.depth, &mut tree_bck, z, &ctx, &mut self.coins)
            };

            if !core.commit(&outcome, forward, &mut self.coins) {
                break;
            }
        }
        status.stop();

        core.into_transition(z, hamiltonian)
    }
}

impl Default for SerialDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Stride separating derived seed streams; keeps the coin streams of nearby
/// chain seeds from colliding.
pub(crate) const SEED_STREAM_GAMMA: u64 = 0x9E3779B97F4A7C15;

/// Seeding shared between the driver implementations: the main stream gets
/// the seed itself, worker stream `i` gets `seed + (i + 1) * GAMMA`, so the
/// sequential driver and a one-worker speculative driver consume identical
/// sequences.
pub(crate) trait SeedStreams {
    fn reseed_streams(&mut self, seed: u64);
}

impl SeedStreams for SerialDriver {
    fn reseed_streams(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
        self.coins = SmallRng::seed_from_u64(seed.wrapping_add(SEED_STREAM_GAMMA));
    }
}

impl<V, Target> TrajectoryDriver<V, Target> for SerialDriver
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    StandardNormal: RandDistribution<V::Scalar>,
    StandardUniform: RandDistribution<V::Scalar>,
{
    fn transition(
        &mut self,
        z: &mut PhaseState<V>,
        hamiltonian: &EuclideanHamiltonian<V, Target>,
        integrator: &Leapfrog<V::Scalar>,
        opts: &NutsOptions<V::Scalar>,
    ) -> Transition<V> {
        assert!(opts.max_depth > 0, "max_depth must be positive");
        hamiltonian.sample_momentum(z, &mut self.rng);
        hamiltonian.init(z);
        self.grow(z, hamiltonian, integrator, opts, None)
    }

    fn reseed(&mut self, seed: u64) {
        self.reseed_streams(seed);
    }
}
