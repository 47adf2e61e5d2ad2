//! Recursive trajectory builder: one doubling of a No-U-Turn trajectory.
//!
//! The builder grows a balanced binary subtree of leapfrog steps in one time
//! direction, accumulating log-domain path weights, the momentum sum, and a
//! multinomially selected proposal. Validity is a boolean: a divergent leaf
//! or a failed criterion short-circuits the whole subtree.

use crate::euclidean::EuclideanVector;
use crate::hamiltonian::{EuclideanHamiltonian, HamiltonianTarget, PhaseState};
use crate::integrator::Leapfrog;
use crate::math::log_sum_exp;
use crate::nuts::NutsOptions;
use num_traits::{Float, FromPrimitive, One, Zero};
use rand::distr::Distribution as RandDistribution;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardUniform;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative stop signal shared by everything working on one transition.
///
/// Written only by whoever commits global state (the sequential driver, or
/// the totally ordered check chain); read as a cheap hint at every leaf
/// before integrating and at the head of every extension task. A stale read
/// can only cause extra speculative work, never an incorrect result, because
/// validity is always re-derived from the builder's own return value.
#[derive(Debug)]
pub struct TrajectoryStatus {
    running: AtomicBool,
}

impl TrajectoryStatus {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for TrajectoryStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// The no-U-turn criterion.
///
/// Holds while the momentum sum `rho` still points "forward" as seen from
/// both trajectory ends. Pure; safe to call concurrently on independent
/// arguments.
pub fn compute_criterion<V: EuclideanVector>(p_sharp_minus: &V, p_sharp_plus: &V, rho: &V) -> bool {
    p_sharp_plus.dot(rho) > V::Scalar::zero() && p_sharp_minus.dot(rho) > V::Scalar::zero()
}

/// One time-direction of a growing trajectory.
pub(crate) struct Subtree<V: EuclideanVector> {
    /// +1 future, -1 past.
    pub(crate) sign: V::Scalar,
    /// The direction's far boundary; advanced by successive extensions.
    pub(crate) end_state: PhaseState<V>,
    /// Most recent multinomially selected candidate from this direction.
    pub(crate) proposed_state: PhaseState<V>,
    /// Kinetic-energy gradient at `end_state`.
    pub(crate) boundary_gradient: V,
    /// Leapfrog steps taken by the current extension.
    pub(crate) leapfrog_count: usize,
    /// Metropolis-probability sum of the current extension.
    pub(crate) metro_prob_sum: V::Scalar,
}

impl<V: EuclideanVector> Subtree<V> {
    pub(crate) fn new(sign: V::Scalar, z: &PhaseState<V>, p_sharp: &V) -> Self {
        Self {
            sign,
            end_state: z.clone(),
            proposed_state: z.clone(),
            boundary_gradient: p_sharp.clone(),
            leapfrog_count: 0,
            metro_prob_sum: V::Scalar::zero(),
        }
    }
}

/// Result of extending one direction by one doubling.
pub(crate) struct ExtendOutcome<V: EuclideanVector> {
    pub(crate) valid: bool,
    pub(crate) log_sum_weight: V::Scalar,
    pub(crate) rho: V,
    pub(crate) boundary_gradient: V,
    pub(crate) proposal: PhaseState<V>,
    pub(crate) leapfrog_count: usize,
    pub(crate) metro_prob_sum: V::Scalar,
    pub(crate) divergent: bool,
}

/// Read-only context threaded through the recursion.
pub(crate) struct TreeContext<'a, V, Target>
where
    V: EuclideanVector,
    Target: HamiltonianTarget<V>,
{
    pub(crate) hamiltonian: &'a EuclideanHamiltonian<V, Target>,
    pub(crate) integrator: &'a Leapfrog<V::Scalar>,
    pub(crate) opts: &'a NutsOptions<V::Scalar>,
    pub(crate) status: &'a TrajectoryStatus,
    pub(crate) h0: V::Scalar,
}

/// Grows `tree` by a subtree of `2^depth` leapfrog steps in its direction.
///
/// `z` is the direction's working state: it is set from the tree's end
/// boundary, advanced in place by the recursion, and written back as the new
/// boundary. Per-extension counters are reset on entry so the outcome
/// reports exactly this doubling's work.
pub(crate) fn extend_tree<V, Target>(
    depth: usize,
    tree: &mut Subtree<V>,
    z: &mut PhaseState<V>,
    ctx: &TreeContext<'_, V, Target>,
    rng: &mut SmallRng,
) -> ExtendOutcome<V>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    StandardUniform: RandDistribution<V::Scalar>,
{
    tree.leapfrog_count = 0;
    tree.metro_prob_sum = V::Scalar::zero();

    let mut p_sharp_dummy = tree.boundary_gradient.zeros_like();
    let mut rho_subtree = tree.boundary_gradient.zeros_like();
    let mut log_sum_weight_subtree = V::Scalar::neg_infinity();
    let mut divergent = false;

    z.assign(&tree.end_state);

    let valid = build_tree(
        depth,
        z,
        &mut tree.proposed_state,
        &mut p_sharp_dummy,
        &mut tree.boundary_gradient,
        &mut rho_subtree,
        &mut divergent,
        ctx,
        tree.sign,
        &mut tree.leapfrog_count,
        &mut log_sum_weight_subtree,
        &mut tree.metro_prob_sum,
        rng,
    );

    tree.end_state.assign(z);

    ExtendOutcome {
        valid,
        log_sum_weight: log_sum_weight_subtree,
        rho: rho_subtree,
        boundary_gradient: tree.boundary_gradient.clone(),
        proposal: tree.proposed_state.clone(),
        leapfrog_count: tree.leapfrog_count,
        metro_prob_sum: tree.metro_prob_sum,
        divergent,
    }
}

/// Recursively builds a subtree to completion or until it becomes invalid.
///
/// Returns the validity of the resulting subtree. `p_sharp_left` and
/// `p_sharp_right` receive the kinetic-energy gradients at the subtree's
/// outermost leaves; interior boundaries are discarded on the way up.
#[allow(clippy::too_many_arguments)]
fn build_tree<V, Target>(
    depth: usize,
    z: &mut PhaseState<V>,
    z_propose: &mut PhaseState<V>,
    p_sharp_left: &mut V,
    p_sharp_right: &mut V,
    rho: &mut V,
    divergent: &mut bool,
    ctx: &TreeContext<'_, V, Target>,
    sign: V::Scalar,
    n_leapfrog: &mut usize,
    log_sum_weight: &mut V::Scalar,
    sum_metro_prob: &mut V::Scalar,
    rng: &mut SmallRng,
) -> bool
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    StandardUniform: RandDistribution<V::Scalar>,
{
    if depth == 0 {
        // Leaf: cheap cooperative cancellation point before any real work.
        if !ctx.status.is_running() {
            return false;
        }

        ctx.integrator.evolve(z, ctx.hamiltonian, sign);
        *n_leapfrog += 1;

        let mut h = ctx.hamiltonian.total_energy(z);
        if h.is_nan() {
            h = V::Scalar::infinity();
        }

        let is_divergent = (h - ctx.h0) > ctx.opts.max_delta_energy;
        if is_divergent {
            *divergent = true;
        }

        *log_sum_weight = log_sum_exp(*log_sum_weight, ctx.h0 - h);

        if ctx.h0 - h > V::Scalar::zero() {
            *sum_metro_prob = *sum_metro_prob + V::Scalar::one();
        } else {
            *sum_metro_prob = *sum_metro_prob + (ctx.h0 - h).exp();
        }

        z_propose.assign(z);
        rho.add_assign(&z.momentum);

        ctx.hamiltonian.kinetic_gradient(z, p_sharp_left);
        p_sharp_right.assign(p_sharp_left);

        return !is_divergent;
    }

    // Build the left half; its far boundary is interior to this subtree.
    let mut p_sharp_dummy = p_sharp_left.zeros_like();

    let mut log_sum_weight_left = V::Scalar::neg_infinity();
    let mut rho_left = rho.zeros_like();

    let valid_left = build_tree(
        depth - 1,
        z,
        z_propose,
        p_sharp_left,
        &mut p_sharp_dummy,
        &mut rho_left,
        divergent,
        ctx,
        sign,
        n_leapfrog,
        &mut log_sum_weight_left,
        sum_metro_prob,
        rng,
    );

    if !valid_left {
        return false;
    }

    // Build the right half, continuing from the advanced state.
    let mut z_propose_right = z.clone();

    let mut log_sum_weight_right = V::Scalar::neg_infinity();
    let mut rho_right = rho.zeros_like();

    let valid_right = build_tree(
        depth - 1,
        z,
        &mut z_propose_right,
        &mut p_sharp_dummy,
        p_sharp_right,
        &mut rho_right,
        divergent,
        ctx,
        sign,
        n_leapfrog,
        &mut log_sum_weight_right,
        sum_metro_prob,
        rng,
    );

    if !valid_right {
        return false;
    }

    // Multinomial sample between the two halves.
    let log_sum_weight_subtree = log_sum_exp(log_sum_weight_left, log_sum_weight_right);
    *log_sum_weight = log_sum_exp(*log_sum_weight, log_sum_weight_subtree);

    if log_sum_weight_right > log_sum_weight_subtree {
        z_propose.assign(&z_propose_right);
    } else {
        let accept_prob = (log_sum_weight_right - log_sum_weight_subtree).exp();
        let u: V::Scalar = rng.random();
        if u < accept_prob {
            z_propose.assign(&z_propose_right);
        }
    }

    let mut rho_subtree = rho_left;
    rho_subtree.add_assign(&rho_right);
    rho.add_assign(&rho_subtree);

    // Validity of the combined subtree is judged against its own momentum
    // sum, not the trajectory-wide one.
    compute_criterion(p_sharp_left, p_sharp_right, &rho_subtree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamiltonian::HamiltonianTarget;
    use ndarray::{arr1, Array1};
    use rand::SeedableRng;

    /// Flat target: logp = 0 everywhere, so H is kinetic energy only and the
    /// leapfrog leaves momentum untouched.
    struct Flat;

    impl HamiltonianTarget<Array1<f64>> for Flat {
        fn logp_and_grad(&self, _position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
            grad.fill(0.0);
            0.0
        }
    }

    fn flat_setup(
        momentum: f64,
        max_delta_energy: f64,
    ) -> (
        EuclideanHamiltonian<Array1<f64>, Flat>,
        Leapfrog<f64>,
        NutsOptions<f64>,
        PhaseState<Array1<f64>>,
    ) {
        let ham = EuclideanHamiltonian::unit_metric(Flat, &arr1(&[0.0_f64]));
        let mut z = PhaseState::new(arr1(&[0.0_f64]));
        ham.init(&mut z);
        z.momentum = arr1(&[momentum]);
        let opts = NutsOptions {
            max_depth: 10,
            max_delta_energy,
        };
        (ham, Leapfrog::new(0.5), opts, z)
    }

    #[test]
    fn criterion_holds_for_aligned_momenta() {
        // rho = 2p and both boundaries equal to p: both dots are 2‖p‖² > 0.
        let p = arr1(&[0.3_f64, -1.2, 0.7]);
        let rho = p.mapv(|x| 2.0 * x);
        assert!(compute_criterion(&p, &p, &rho));
    }

    #[test]
    fn criterion_fails_for_zero_rho() {
        let p = arr1(&[0.3_f64, -1.2, 0.7]);
        let rho = Array1::zeros(3);
        assert!(!compute_criterion(&p, &p, &rho));
        let q = arr1(&[1.0_f64, 0.0, 0.0]);
        assert!(!compute_criterion(&q, &q, &rho));
    }

    #[test]
    fn criterion_fails_when_one_end_turns_back() {
        let forward = arr1(&[1.0_f64, 0.0]);
        let backward = arr1(&[-1.0_f64, 0.0]);
        let rho = arr1(&[1.0_f64, 0.0]);
        assert!(!compute_criterion(&backward, &forward, &rho));
    }

    #[test]
    fn leaf_weight_matches_energy_error() {
        // Flat potential, p = sqrt(2): h = 1 at every step. With h0 = 0 the
        // single-leaf weight is h0 - h = -1 and the Metropolis contribution
        // is exp(-1).
        let (ham, integrator, opts, z0) = flat_setup(2.0_f64.sqrt(), 1000.0);
        let status = TrajectoryStatus::new();
        let ctx = TreeContext {
            hamiltonian: &ham,
            integrator: &integrator,
            opts: &opts,
            status: &status,
            h0: 0.0,
        };
        let mut p_sharp = z0.momentum.zeros_like();
        ham.kinetic_gradient(&z0, &mut p_sharp);
        let mut tree = Subtree::new(1.0, &z0, &p_sharp);
        let mut z = z0.clone();
        let mut rng = SmallRng::seed_from_u64(0);

        let outcome = extend_tree(0, &mut tree, &mut z, &ctx, &mut rng);
        assert!(outcome.valid);
        assert!(!outcome.divergent);
        assert_eq!(outcome.leapfrog_count, 1);
        assert!((outcome.log_sum_weight - (-1.0)).abs() < 1e-12);
        assert!((outcome.metro_prob_sum - (-1.0_f64).exp()).abs() < 1e-12);
        assert!((outcome.metro_prob_sum - 0.367879).abs() < 1e-6);
    }

    #[test]
    fn leaf_metro_contribution_is_capped_at_one() {
        // h = 1 with h0 = 2: weight is +1 and the contribution caps at 1.
        let (ham, integrator, opts, z0) = flat_setup(2.0_f64.sqrt(), 1000.0);
        let status = TrajectoryStatus::new();
        let ctx = TreeContext {
            hamiltonian: &ham,
            integrator: &integrator,
            opts: &opts,
            status: &status,
            h0: 2.0,
        };
        let mut p_sharp = z0.momentum.zeros_like();
        ham.kinetic_gradient(&z0, &mut p_sharp);
        let mut tree = Subtree::new(1.0, &z0, &p_sharp);
        let mut z = z0.clone();
        let mut rng = SmallRng::seed_from_u64(0);

        let outcome = extend_tree(0, &mut tree, &mut z, &ctx, &mut rng);
        assert!(outcome.valid);
        assert!((outcome.log_sum_weight - 1.0).abs() < 1e-12);
        assert!((outcome.metro_prob_sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn divergent_leaf_invalidates_every_ancestor() {
        // Energy error is 1 at every leaf; a threshold of 0.5 diverges on the
        // very first leaf, and the depth-3 subtree must short-circuit there.
        let (ham, integrator, opts, z0) = flat_setup(2.0_f64.sqrt(), 0.5);
        let status = TrajectoryStatus::new();
        let ctx = TreeContext {
            hamiltonian: &ham,
            integrator: &integrator,
            opts: &opts,
            status: &status,
            h0: 0.0,
        };
        let mut p_sharp = z0.momentum.zeros_like();
        ham.kinetic_gradient(&z0, &mut p_sharp);
        let mut tree = Subtree::new(1.0, &z0, &p_sharp);
        let mut z = z0.clone();
        let mut rng = SmallRng::seed_from_u64(0);

        let outcome = extend_tree(3, &mut tree, &mut z, &ctx, &mut rng);
        assert!(!outcome.valid);
        assert!(outcome.divergent);
        assert_eq!(outcome.leapfrog_count, 1, "left-first short-circuit");
    }

    #[test]
    fn nan_energy_is_clamped_to_a_divergence() {
        // A target whose log-density is NaN everywhere: the leaf energy is
        // sanitized to +inf, which reads as a divergence, and no NaN leaks
        // into the accumulated weights.
        struct Undefined;

        impl HamiltonianTarget<Array1<f64>> for Undefined {
            fn logp_and_grad(&self, _position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
                grad.fill(0.0);
                f64::NAN
            }
        }

        let ham = EuclideanHamiltonian::unit_metric(Undefined, &arr1(&[0.0_f64]));
        let mut z0 = PhaseState::new(arr1(&[0.0_f64]));
        ham.init(&mut z0);
        z0.momentum = arr1(&[1.0]);
        let opts = NutsOptions {
            max_depth: 10,
            max_delta_energy: 1000.0,
        };
        let integrator = Leapfrog::new(0.5);
        let status = TrajectoryStatus::new();
        let ctx = TreeContext {
            hamiltonian: &ham,
            integrator: &integrator,
            opts: &opts,
            status: &status,
            h0: 0.0,
        };
        let mut p_sharp = z0.momentum.zeros_like();
        ham.kinetic_gradient(&z0, &mut p_sharp);
        let mut tree = Subtree::new(1.0, &z0, &p_sharp);
        let mut z = z0.clone();
        let mut rng = SmallRng::seed_from_u64(0);

        let outcome = extend_tree(0, &mut tree, &mut z, &ctx, &mut rng);
        assert!(!outcome.valid);
        assert!(outcome.divergent);
        assert_eq!(outcome.log_sum_weight, f64::NEG_INFINITY);
        assert_eq!(outcome.metro_prob_sum, 0.0);
        assert!(!outcome.log_sum_weight.is_nan());
    }

    #[test]
    fn stopped_status_skips_leaf_work() {
        let (ham, integrator, opts, z0) = flat_setup(1.0, 1000.0);
        let status = TrajectoryStatus::new();
        status.stop();
        let ctx = TreeContext {
            hamiltonian: &ham,
            integrator: &integrator,
            opts: &opts,
            status: &status,
            h0: 0.0,
        };
        let mut p_sharp = z0.momentum.zeros_like();
        ham.kinetic_gradient(&z0, &mut p_sharp);
        let mut tree = Subtree::new(1.0, &z0, &p_sharp);
        let mut z = z0.clone();
        let mut rng = SmallRng::seed_from_u64(0);

        let outcome = extend_tree(2, &mut tree, &mut z, &ctx, &mut rng);
        assert!(!outcome.valid);
        assert_eq!(outcome.leapfrog_count, 0, "no integration after stop");
        assert!(!outcome.divergent);
    }

    #[test]
    fn deeper_subtrees_accumulate_all_leaves() {
        let (ham, integrator, opts, z0) = flat_setup(2.0_f64.sqrt(), 1000.0);
        let status = TrajectoryStatus::new();
        let ctx = TreeContext {
            hamiltonian: &ham,
            integrator: &integrator,
            opts: &opts,
            status: &status,
            h0: 0.0,
        };
        let mut p_sharp = z0.momentum.zeros_like();
        ham.kinetic_gradient(&z0, &mut p_sharp);
        let mut tree = Subtree::new(1.0, &z0, &p_sharp);
        let mut z = z0.clone();
        let mut rng = SmallRng::seed_from_u64(11);

        let outcome = extend_tree(3, &mut tree, &mut z, &ctx, &mut rng);
        assert!(outcome.valid);
        assert_eq!(outcome.leapfrog_count, 8);
        // Eight leaves, each of weight exp(-1).
        let expected = (8.0_f64 * (-1.0_f64).exp()).ln();
        assert!((outcome.log_sum_weight - expected).abs() < 1e-12);
        // Flat target: the trajectory never turns, rho keeps growing.
        assert!((outcome.rho[0] - 8.0 * 2.0_f64.sqrt()).abs() < 1e-12);
        // End state advanced by 8 steps of eps * p.
        assert!((tree.end_state.position[0] - 8.0 * 0.5 * 2.0_f64.sqrt()).abs() < 1e-12);
    }
}
