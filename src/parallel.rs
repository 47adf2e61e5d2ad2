//! Speculative trajectory driver.
//!
//! The forward and backward subtrees of one transition are extended
//! concurrently: each direction is a chain of "extend" tasks with no edges
//! to the other direction, so a worker can keep integrating one direction
//! while the other is still busy. A separate, totally ordered chain of
//! "check" tasks folds extension outcomes into the global trajectory in
//! logical depth order and evaluates the stopping criterion; it alone
//! mutates shared state. Work performed past the stopping point is
//! speculative and its results are discarded by the corresponding check.

use crate::euclidean::EuclideanVector;
use crate::graph::TaskGraph;
use crate::hamiltonian::{EuclideanHamiltonian, HamiltonianTarget, PhaseState};
use crate::integrator::Leapfrog;
use crate::nuts::{
    NutsOptions, SeedStreams, TrajectoryDriver, Transition, TransitionCore,
};
use crate::tree::{extend_tree, ExtendOutcome, Subtree, TrajectoryStatus, TreeContext};
use num_traits::{Float, FromPrimitive, One};
use rand::distr::Distribution as RandDistribution;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{StandardNormal, StandardUniform};
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Task-graph driver building both trajectory directions speculatively.
///
/// With exactly one worker the graph is wired so that it degenerates to the
/// sequential driver's total order, and — given the same seed and direction
/// plan — reproduces the sequential driver's transitions exactly.
pub struct SpeculativeDriver {
    rng: SmallRng,
    worker_rngs: Vec<Mutex<SmallRng>>,
    pool: rayon::ThreadPool,
}

impl SpeculativeDriver {
    /// Creates a driver with its own pool of `num_workers` threads.
    pub fn new(num_workers: usize) -> Result<Self, Box<dyn Error>> {
        assert!(num_workers > 0, "num_workers must be positive");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .build()?;
        let mut thread_rng = rand::rng();
        let rng = SmallRng::from_rng(&mut thread_rng);
        let worker_rngs = (0..num_workers)
            .map(|_| Mutex::new(SmallRng::from_rng(&mut thread_rng)))
            .collect();
        Ok(Self {
            rng,
            worker_rngs,
            pool,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.reseed_streams(seed);
        self
    }

    /// Runs one transition with a fixed direction plan.
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
        V: EuclideanVector + Send + Sync,
        V::Scalar: Float + FromPrimitive + Send + Sync,
        Target: HamiltonianTarget<V> + Sync,
        StandardNormal: RandDistribution<V::Scalar>,
        StandardUniform: RandDistribution<V::Scalar>,
    {
        hamiltonian.sample_momentum(z, &mut self.rng);
        hamiltonian.init(z);
        self.grow(z, hamiltonian, integrator, opts, plan)
    }

    fn grow<V, Target>(
        &mut self,
        z: &mut PhaseState<V>,
        hamiltonian: &EuclideanHamiltonian<V, Target>,
        integrator: &Leapfrog<V::Scalar>,
        opts: &NutsOptions<V::Scalar>,
        plan: &[bool],
    ) -> Transition<V>
    where
        V: EuclideanVector + Send + Sync,
        V::Scalar: Float + FromPrimitive + Send + Sync,
        Target: HamiltonianTarget<V> + Sync,
        StandardUniform: RandDistribution<V::Scalar>,
    {
        let max_depth = opts.max_depth;
        debug_assert_eq!(plan.len(), max_depth);

        let h0 = hamiltonian.total_energy(z);
        let mut p_sharp = z.momentum.zeros_like();
        hamiltonian.kinetic_gradient(z, &mut p_sharp);

        let status = TrajectoryStatus::new();
        let core = Mutex::new(TransitionCore::new(z, &p_sharp));

        let one = V::Scalar::one();
        // Each direction owns its subtree and a scratch state; the per-
        // direction extend chain is totally ordered, so the lock is never
        // contended.
        let fwd = Mutex::new((Subtree::new(one, z, &p_sharp), z.clone()));
        let bck = Mutex::new((Subtree::new(-one, z, &p_sharp), z.clone()));

        let ctx = TreeContext {
            hamiltonian,
            integrator,
            opts,
            status: &status,
            h0,
        };

        let num_fwd = plan.iter().filter(|&&forward| forward).count();
        let num_bck = max_depth - num_fwd;
        let fwd_ok: Vec<AtomicBool> = (0..num_fwd).map(|_| AtomicBool::new(true)).collect();
        let bck_ok: Vec<AtomicBool> = (0..num_bck).map(|_| AtomicBool::new(true)).collect();

        let slots: Vec<Mutex<Option<ExtendOutcome<V>>>> =
            (0..max_depth).map(|_| Mutex::new(None)).collect();

        let worker_rngs = &self.worker_rngs;
        let serial = self.pool.current_num_threads() == 1;

        let mut graph = TaskGraph::new();

        // Extend tasks: one per depth, chained within each direction only.
        let mut extend_ids = Vec::with_capacity(max_depth);
        let mut fwd_ids: Vec<usize> = Vec::new();
        let mut bck_ids: Vec<usize> = Vec::new();
        for (depth, &forward) in plan.iter().enumerate() {
            let (tree, dir_ok, dir_ids) = if forward {
                (&fwd, &fwd_ok, &mut fwd_ids)
            } else {
                (&bck, &bck_ok, &mut bck_ids)
            };
            let chain_idx = dir_ids.len();
            let slot = &slots[depth];
            let ctx = &ctx;
            let node = graph.add_node(move |worker| {
                // Consult only this direction's own history; the global
                // flag is read inside the builder's leaves and the checks.
                let parent_ok = chain_idx == 0 || dir_ok[chain_idx - 1].load(Ordering::Acquire);
                if !parent_ok {
                    dir_ok[chain_idx].store(false, Ordering::Release);
                    return;
                }
                let mut guard = tree.lock().expect("subtree lock poisoned");
                let (tree, scratch) = &mut *guard;
                let mut rng = worker_rngs[worker].lock().expect("worker rng lock poisoned");
                let outcome = extend_tree(depth, tree, scratch, ctx, &mut rng);
                let valid = outcome.valid;
                *slot.lock().expect("extension slot lock poisoned") = Some(outcome);
                dir_ok[chain_idx].store(valid, Ordering::Release);
            });
            if let Some(&prev) = dir_ids.last() {
                graph.add_edge(prev, node);
            }
            dir_ids.push(node);
            extend_ids.push(node);
        }

        // Check tasks: strict total order over depths; the only writers of
        // the transition accumulators and the stop flag.
        let mut check_ids: Vec<usize> = Vec::with_capacity(max_depth);
        for (depth, &forward) in plan.iter().enumerate() {
            let slot = &slots[depth];
            let core = &core;
            let status = &status;
            let node = graph.add_node(move |worker| {
                if !status.is_running() {
                    return;
                }
                let outcome = slot.lock().expect("extension slot lock poisoned").take();
                let outcome = match outcome {
                    Some(outcome) => outcome,
                    // The extension was skipped because its direction had
                    // already failed; its own check stopped the trajectory
                    // first, so this is unreachable while running. Treat it
                    // as a stop all the same.
                    None => {
                        status.stop();
                        return;
                    }
                };
                let mut core = core.lock().expect("core lock poisoned");
                let mut rng = worker_rngs[worker].lock().expect("worker rng lock poisoned");
                if !core.commit(&outcome, forward, &mut rng) {
                    status.stop();
                }
            });
            graph.add_edge(extend_ids[depth], node);
            if let Some(&prev) = check_ids.last() {
                graph.add_edge(prev, node);
            }
            check_ids.push(node);
        }

        // One worker cannot speculate: interleave extends with checks so the
        // graph replays the sequential order exactly.
        if serial {
            for depth in 1..max_depth {
                graph.add_edge(check_ids[depth - 1], extend_ids[depth]);
            }
        }

        graph.run(&self.pool);
        drop(graph);

        status.stop();
        let core = core.into_inner().expect("core lock poisoned");
        core.into_transition(z, hamiltonian)
    }
}

impl SeedStreams for SpeculativeDriver {
    fn reseed_streams(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
        for (i, rng) in self.worker_rngs.iter_mut().enumerate() {
            *rng.get_mut().expect("worker rng lock poisoned") = SmallRng::seed_from_u64(
                seed.wrapping_add((i as u64 + 1).wrapping_mul(crate::nuts::SEED_STREAM_GAMMA)),
            );
        }
    }
}

impl<V, Target> TrajectoryDriver<V, Target> for SpeculativeDriver
where
    V: EuclideanVector + Send + Sync,
    V::Scalar: Float + FromPrimitive + Send + Sync,
    Target: HamiltonianTarget<V> + Sync,
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
        // The whole plan is drawn before any extension runs; this is the
        // only serial randomness in the transition.
        let half = V::Scalar::from_f64(0.5).unwrap();
        let plan: Vec<bool> = (0..opts.max_depth)
            .map(|_| {
                let u: V::Scalar = self.rng.random();
                u > half
            })
            .collect();
        self.grow(z, hamiltonian, integrator, opts, &plan)
    }

    fn reseed(&mut self, seed: u64) {
        self.reseed_streams(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nuts::SerialDriver;
    use ndarray::{arr1, Array1};

    struct StdNormal;

    impl HamiltonianTarget<Array1<f64>> for StdNormal {
        fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
            grad.assign(&position.mapv(|x| -x));
            -0.5 * position.dot(position)
        }
    }

    struct Flat;

    impl HamiltonianTarget<Array1<f64>> for Flat {
        fn logp_and_grad(&self, _position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
            grad.fill(0.0);
            0.0
        }
    }

    fn setup(
        step_size: f64,
    ) -> (
        EuclideanHamiltonian<Array1<f64>, StdNormal>,
        Leapfrog<f64>,
        NutsOptions<f64>,
    ) {
        let ham = EuclideanHamiltonian::unit_metric(StdNormal, &arr1(&[0.0_f64, 0.0]));
        (ham, Leapfrog::new(step_size), NutsOptions::default())
    }

    #[test]
    fn one_worker_reproduces_the_sequential_driver() {
        let (ham, integrator, _) = setup(0.25);
        let opts = NutsOptions {
            max_depth: 6,
            max_delta_energy: 1000.0,
        };
        let plans = [
            vec![true, false, true, true, false, true],
            vec![false, false, true, false, true, true],
            vec![true, true, true, false, false, false],
        ];

        let mut z_serial = PhaseState::new(arr1(&[0.9_f64, -1.4]));
        let mut z_spec = z_serial.clone();
        ham.init(&mut z_serial);
        ham.init(&mut z_spec);

        let mut serial = SerialDriver::new().set_seed(42);
        let mut speculative = SpeculativeDriver::new(1)
            .expect("building one-worker pool")
            .set_seed(42);

        // Chained transitions stay in lockstep: both drivers consume the
        // same draws from the same streams in the same order.
        for plan in &plans {
            let a = serial.transition_with_plan(&mut z_serial, &ham, &integrator, &opts, plan);
            let b = speculative.transition_with_plan(&mut z_spec, &ham, &integrator, &opts, plan);
            assert_eq!(a.depth, b.depth);
            assert_eq!(a.n_leapfrog, b.n_leapfrog);
            assert_eq!(a.divergent, b.divergent);
            assert_eq!(a.sample.position, b.sample.position);
            assert_eq!(a.sample.log_density, b.sample.log_density);
            assert_eq!(a.sample.accept_prob, b.sample.accept_prob);
            assert_eq!(a.energy, b.energy);
            assert_eq!(a.log_sum_weight, b.log_sum_weight);
        }
    }

    #[test]
    fn speculative_work_is_discarded_on_divergence() {
        // Every leaf diverges (negative threshold). The backward head runs
        // speculatively on a second worker, but only the committed forward
        // extension may be accounted.
        let ham = EuclideanHamiltonian::unit_metric(Flat, &arr1(&[0.0_f64]));
        let integrator = Leapfrog::new(0.5);
        let opts = NutsOptions {
            max_depth: 4,
            max_delta_energy: -1.0,
        };
        let plan = vec![true, false, true, false];

        let mut driver = SpeculativeDriver::new(2)
            .expect("building two-worker pool")
            .set_seed(5);
        let mut z = PhaseState::new(arr1(&[0.0_f64]));
        ham.init(&mut z);
        let t = driver.transition_with_plan(&mut z, &ham, &integrator, &opts, &plan);

        assert_eq!(t.depth, 0);
        assert!(t.divergent);
        assert_eq!(t.n_leapfrog, 1, "speculative leapfrog steps must not count");
        assert!(t.sample.accept_prob >= 0.0 && t.sample.accept_prob <= 1.0);
        assert_eq!(t.sample.position[0], 0.0, "initial point is kept");
    }

    #[test]
    fn multi_worker_transitions_respect_invariants() {
        let (ham, integrator, opts) = setup(0.2);
        let mut driver = SpeculativeDriver::new(4)
            .expect("building four-worker pool")
            .set_seed(11);
        let mut z = PhaseState::new(arr1(&[0.3_f64, 0.8]));
        ham.init(&mut z);
        for _ in 0..25 {
            let t = driver.transition(&mut z, &ham, &integrator, &opts);
            assert!(t.depth <= opts.max_depth);
            assert!(t.sample.accept_prob >= 0.0 && t.sample.accept_prob <= 1.0);
            assert!(t.energy.is_finite());
            assert!(t.sample.position.iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn depth_limit_binds_under_speculation() {
        // Flat target never turns nor diverges: every plan entry commits.
        let ham = EuclideanHamiltonian::unit_metric(Flat, &arr1(&[0.0_f64]));
        let integrator = Leapfrog::new(0.5);
        let opts = NutsOptions {
            max_depth: 5,
            max_delta_energy: 1000.0,
        };
        let mut driver = SpeculativeDriver::new(3)
            .expect("building three-worker pool")
            .set_seed(21);
        let mut z = PhaseState::new(arr1(&[0.0_f64]));
        ham.init(&mut z);
        let t = driver.transition(&mut z, &ham, &integrator, &opts);
        assert_eq!(t.depth, 5);
        assert!(!t.divergent);
        assert_eq!(t.n_leapfrog, 31);
        assert!((t.sample.accept_prob - 1.0).abs() < 1e-12);
    }
}
