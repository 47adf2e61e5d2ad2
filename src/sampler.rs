//! Multi-chain NUTS front end.
//!
//! [`NutsChain`] wraps one trajectory driver with its Hamiltonian,
//! integrator and current state; [`NutsSampler`] runs several such chains in
//! parallel and collects their draws, with optional progress reporting that
//! surfaces the NUTS diagnostics (acceptance statistic, divergences, tree
//! depth).

use crate::core::{run_chain, spawn_progress_thread, MarkovChain};
use crate::euclidean::EuclideanVector;
use crate::hamiltonian::{EuclideanHamiltonian, HamiltonianTarget, PhaseState};
use crate::integrator::Leapfrog;
use crate::nuts::{NutsOptions, SerialDriver, TrajectoryDriver, Transition};
use crate::parallel::SpeculativeDriver;
use crate::stats::{ChainStats, NutsTracker, RunStats};
use ndarray::{stack, Array2, Array3, ArrayView1, ArrayView2, Axis, ShapeError};
use num_traits::{Float, FromPrimitive, ToPrimitive, Zero};
use rayon::prelude::*;
use std::error::Error;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A single NUTS chain: one driver plus the state it advances.
pub struct NutsChain<V, Target, D>
where
    V: EuclideanVector,
    Target: HamiltonianTarget<V>,
{
    hamiltonian: EuclideanHamiltonian<V, Target>,
    integrator: Leapfrog<V::Scalar>,
    opts: NutsOptions<V::Scalar>,
    driver: D,
    z: PhaseState<V>,
    last: Option<Transition<V>>,
    state_buf: Vec<V::Scalar>,
}

impl<V, Target> NutsChain<V, Target, SerialDriver>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
{
    /// Creates a sequential chain with the unit metric.
    pub fn new(target: Target, initial_position: V, step_size: V::Scalar) -> Self {
        let hamiltonian = EuclideanHamiltonian::unit_metric(target, &initial_position);
        Self::with_driver(hamiltonian, initial_position, step_size, SerialDriver::new())
    }
}

impl<V, Target> NutsChain<V, Target, SpeculativeDriver>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
{
    /// Creates a chain whose trajectories are built speculatively on a pool
    /// of `num_workers` threads.
    pub fn speculative(
        target: Target,
        initial_position: V,
        step_size: V::Scalar,
        num_workers: usize,
    ) -> Result<Self, Box<dyn Error>> {
        let hamiltonian = EuclideanHamiltonian::unit_metric(target, &initial_position);
        let driver = SpeculativeDriver::new(num_workers)?;
        Ok(Self::with_driver(
            hamiltonian,
            initial_position,
            step_size,
            driver,
        ))
    }
}

impl<V, Target, D> NutsChain<V, Target, D>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
{
    /// Assembles a chain from its parts; the general form of the
    /// constructors above.
    pub fn with_driver(
        hamiltonian: EuclideanHamiltonian<V, Target>,
        initial_position: V,
        step_size: V::Scalar,
        driver: D,
    ) -> Self {
        let mut z = PhaseState::new(initial_position);
        hamiltonian.init(&mut z);
        let mut state_buf = vec![V::Scalar::zero(); z.dim()];
        z.position.write_to_slice(&mut state_buf);
        Self {
            hamiltonian,
            integrator: Leapfrog::new(step_size),
            opts: NutsOptions::default(),
            driver,
            z,
            last: None,
            state_buf,
        }
    }

    /// Replaces the trajectory-growth limits.
    pub fn with_options(mut self, opts: NutsOptions<V::Scalar>) -> Self {
        assert!(opts.max_depth > 0, "max_depth must be positive");
        self.opts = opts;
        self
    }

    pub fn position(&self) -> &V {
        &self.z.position
    }

    /// Diagnostics of the most recent transition, if any.
    pub fn last_transition(&self) -> Option<&Transition<V>> {
        self.last.as_ref()
    }

    pub fn options(&self) -> &NutsOptions<V::Scalar> {
        &self.opts
    }
}

impl<V, Target, D> NutsChain<V, Target, D>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    D: TrajectoryDriver<V, Target>,
{
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.driver.reseed(seed);
        self
    }

    /// Performs one NUTS transition and returns its diagnostics.
    pub fn step_transition(&mut self) -> &Transition<V> {
        let transition =
            self.driver
                .transition(&mut self.z, &self.hamiltonian, &self.integrator, &self.opts);
        self.z.position.write_to_slice(&mut self.state_buf);
        self.last = Some(transition);
        self.last.as_ref().unwrap()
    }
}

impl<V, Target, D> MarkovChain<V::Scalar> for NutsChain<V, Target, D>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    D: TrajectoryDriver<V, Target>,
{
    fn step(&mut self) -> &[V::Scalar] {
        self.step_transition();
        &self.state_buf
    }

    fn current_state(&self) -> &[V::Scalar] {
        &self.state_buf
    }
}

/// Multiple independent NUTS chains over a shared target.
pub struct NutsSampler<V, Target, D>
where
    V: EuclideanVector,
    Target: HamiltonianTarget<V>,
{
    pub chains: Vec<NutsChain<V, Arc<Target>, D>>,
}

impl<V, Target> NutsSampler<V, Target, SerialDriver>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
{
    /// One sequential chain per initial position, all sharing `target`.
    pub fn new(target: Target, initial_positions: Vec<V>, step_size: V::Scalar) -> Self {
        assert!(
            !initial_positions.is_empty(),
            "initial_positions must not be empty"
        );
        let target = Arc::new(target);
        let chains = initial_positions
            .into_iter()
            .map(|pos| NutsChain::new(Arc::clone(&target), pos, step_size))
            .collect();
        Self { chains }
    }
}

impl<V, Target> NutsSampler<V, Target, SpeculativeDriver>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
{
    /// One speculative chain per initial position, each with its own worker
    /// pool of `num_workers` threads.
    ///
    /// Trajectory-level speculation pays off for expensive gradients; for
    /// many cheap chains prefer [`NutsSampler::new`], which already runs
    /// chains in parallel.
    pub fn speculative(
        target: Target,
        initial_positions: Vec<V>,
        step_size: V::Scalar,
        num_workers: usize,
    ) -> Result<Self, Box<dyn Error>> {
        assert!(
            !initial_positions.is_empty(),
            "initial_positions must not be empty"
        );
        let target = Arc::new(target);
        let chains = initial_positions
            .into_iter()
            .map(|pos| NutsChain::speculative(Arc::clone(&target), pos, step_size, num_workers))
            .collect::<Result<_, _>>()?;
        Ok(Self { chains })
    }
}

impl<V, Target, D> NutsSampler<V, Target, D>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive,
    Target: HamiltonianTarget<V>,
    D: TrajectoryDriver<V, Arc<Target>>,
{
    /// Seeds each chain with `seed + i + 1`, where `i` is the chain index.
    pub fn set_seed(mut self, seed: u64) -> Self {
        for (i, chain) in self.chains.iter_mut().enumerate() {
            chain.driver.reseed(seed + i as u64 + 1);
        }
        self
    }

    /// Replaces the trajectory-growth limits on every chain.
    pub fn with_options(mut self, opts: NutsOptions<V::Scalar>) -> Self {
        assert!(opts.max_depth > 0, "max_depth must be positive");
        for chain in &mut self.chains {
            chain.opts = opts;
        }
        self
    }
}

impl<V, Target, D> NutsSampler<V, Target, D>
where
    V: EuclideanVector + Send,
    V::Scalar: Float + FromPrimitive + ToPrimitive + Send,
    Target: HamiltonianTarget<V> + Send + Sync,
    D: TrajectoryDriver<V, Arc<Target>> + Send,
{
    /// Runs all chains in parallel, discarding the first `n_discard`
    /// transitions, and returns an `[n_chains, n_collect, D]` tensor.
    pub fn run(&mut self, n_collect: usize, n_discard: usize) -> Result<Array3<V::Scalar>, ShapeError> {
        let results: Vec<Array2<V::Scalar>> = self
            .chains
            .par_iter_mut()
            .map(|chain| run_chain(chain, n_collect, n_discard))
            .collect();
        let views: Vec<ArrayView2<V::Scalar>> = results.iter().map(|x| x.view()).collect();
        stack(Axis(0), &views)
    }

    /// Runs all chains in parallel with live progress bars showing the NUTS
    /// diagnostics, and returns the collected sample with run statistics.
    pub fn run_progress(
        &mut self,
        n_collect: usize,
        n_discard: usize,
    ) -> Result<(Array3<V::Scalar>, RunStats), Box<dyn Error>> {
        let chains = &mut self.chains;

        let mut rxs: Vec<Receiver<ChainStats>> = vec![];
        let mut txs: Vec<Sender<ChainStats>> = vec![];
        (0..chains.len()).for_each(|_| {
            let (tx, rx) = mpsc::channel();
            rxs.push(rx);
            txs.push(tx);
        });

        let total: u64 = (n_collect + n_discard).try_into()?;
        let progress_handle = spawn_progress_thread(rxs, total);

        let results: Vec<(Array2<V::Scalar>, ChainStats)> = thread::scope(|s| {
            let handles: Vec<thread::ScopedJoinHandle<(Array2<V::Scalar>, ChainStats)>> = chains
                .iter_mut()
                .zip(txs)
                .map(|(chain, tx)| {
                    s.spawn(|| {
                        run_transitions_progress(chain, n_collect, n_discard, tx)
                            .expect("expected running chain to succeed")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .expect("expected thread to succeed in generating observations")
                })
                .collect()
        });

        let views: Vec<ArrayView2<V::Scalar>> = results.iter().map(|(x, _)| x.view()).collect();
        let sample = stack(Axis(0), &views)?;

        if let Err(e) = progress_handle.join() {
            eprintln!("Progress bar thread emitted error message: {:?}", e);
        }

        let chain_stats: Vec<ChainStats> = results.iter().map(|(_, s)| s.clone()).collect();
        Ok((sample, RunStats::from_chain_stats(&chain_stats)))
    }
}

/// Per-chain progress loop: like [`crate::core::run_chain_progress`], but
/// fed by the transition's own diagnostics instead of state comparisons.
fn run_transitions_progress<V, Target, D>(
    chain: &mut NutsChain<V, Arc<Target>, D>,
    n_collect: usize,
    n_discard: usize,
    tx: Sender<ChainStats>,
) -> Result<(Array2<V::Scalar>, ChainStats), String>
where
    V: EuclideanVector,
    V::Scalar: Float + FromPrimitive + ToPrimitive,
    Target: HamiltonianTarget<V>,
    D: TrajectoryDriver<V, Arc<Target>>,
{
    let dim = chain.z.dim();
    let mut out = Array2::<V::Scalar>::zeros((n_collect, dim));

    let mut tracker = NutsTracker::new();
    let mut last = Instant::now();
    let freq = Duration::from_secs(1);
    let total = n_discard + n_collect;

    for i in 0..total {
        let transition = chain.step_transition();
        let accept = transition
            .sample
            .accept_prob
            .to_f64()
            .ok_or_else(|| "acceptance statistic not representable as f64".to_string())?;
        tracker.record(accept, transition.depth, transition.divergent);

        let now = Instant::now();
        if (now >= last + freq) | (i == total - 1) {
            if let Err(e) = tx.send(tracker.stats()) {
                eprintln!("Sending chain statistics failed: {e}");
            }
            last = now;
        }

        if i >= n_discard {
            out.row_mut(i - n_discard)
                .assign(&ArrayView1::from(chain.current_state()));
        }
    }

    Ok((out, tracker.stats()))
}
