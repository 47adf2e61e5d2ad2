/*!
# Core chain-running utilities.

This module provides the machinery for running Markov chains in parallel:
- The [`MarkovChain<T>`] trait, which abstracts a single MCMC chain.
- Utility functions [`run_chain`] and [`run_chain_progress`] for executing a
  single chain and collecting its states.
- The [`HasChains<T>`] trait for types that own multiple Markov chains, and
  the [`ChainRunner<T>`] extension trait that runs them in parallel (using
  Rayon), discarding burn-in and optionally displaying progress bars.

Any type implementing [`HasChains<T>`] (with the required trait bounds)
automatically implements [`ChainRunner<T>`] via a blanket implementation.
*/

use crate::stats::{ChainStats, ChainTracker, RunStats};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::{prelude::*, stack, ShapeError};
use num_traits::{Float, FromPrimitive};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::error::Error;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A trait that abstracts a single MCMC chain.
pub trait MarkovChain<T> {
    /// Performs one iteration of the chain and returns the new state.
    fn step(&mut self) -> &[T];

    /// Returns the current state of the chain without advancing it.
    fn current_state(&self) -> &[T];
}

/// Runs a single MCMC chain for `n_collect + n_discard` steps and collects
/// the last `n_collect` states into an `[n_collect, D]` array.
pub fn run_chain<T, M>(chain: &mut M, n_collect: usize, n_discard: usize) -> Array2<T>
where
    M: MarkovChain<T>,
    T: ndarray::LinalgScalar,
{
    let dim = chain.current_state().len();
    let mut out = Array2::<T>::zeros((n_collect, dim));
    let total = n_collect + n_discard;

    for i in 0..total {
        let state = chain.step();
        if i >= n_discard {
            let state_arr = ArrayView::from_shape(state.len(), state).unwrap();
            out.row_mut(i - n_discard).assign(&state_arr);
        }
    }

    out
}

/// Like [`run_chain`], but periodically reports [`ChainStats`] through `tx`
/// for progress display. Returns the collected states and the chain's final
/// statistics.
pub fn run_chain_progress<T, M>(
    chain: &mut M,
    n_collect: usize,
    n_discard: usize,
    tx: Sender<ChainStats>,
) -> Result<(Array2<T>, ChainStats), String>
where
    M: MarkovChain<T>,
    T: ndarray::LinalgScalar + PartialEq + num_traits::ToPrimitive,
{
    let n_params = chain.current_state().len();
    let mut out = Array2::<T>::zeros((n_collect, n_params));

    let mut tracker = ChainTracker::new(n_params, chain.current_state());
    let mut last = Instant::now();
    let freq = Duration::from_secs(1);
    let total = n_discard + n_collect;

    for i in 0..total {
        let current_state = chain.step();
        tracker.step(current_state).map_err(|e| {
            format!(
                "Chain statistics tracker caused error: {}.\nAborting generation of further observations.",
                e
            )
        })?;

        let now = Instant::now();
        if (now >= last + freq) | (i == total - 1) {
            if let Err(e) = tx.send(tracker.stats()) {
                eprintln!("Sending chain statistics failed: {e}");
            }
            last = now;
        }

        if i >= n_discard {
            out.row_mut(i - n_discard)
                .assign(&ArrayView1::from_shape(current_state.len(), current_state).unwrap());
        }
    }

    Ok((out, tracker.stats()))
}

/// Spawns the thread that renders per-chain and global progress bars from
/// the [`ChainStats`] streams of all chains.
///
/// Shared between [`ChainRunner::run_progress`] and the NUTS sampler's
/// progress front end.
pub(crate) fn spawn_progress_thread(
    rxs: Vec<Receiver<ChainStats>>,
    total: u64,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let sleep_ms = Duration::from_millis(250);
        let timeout_ms = Duration::from_millis(0);
        let multi = MultiProgress::new();

        let pb_style = ProgressStyle::default_bar()
            .template("{prefix:8} {bar:40.cyan/blue} {pos}/{len} ({eta}) | {msg}")
            .unwrap()
            .progress_chars("=>-");

        let global_pb = multi.add(ProgressBar::new((rxs.len() as u64) * total));
        global_pb.set_style(pb_style.clone());
        global_pb.set_prefix("Global");

        let mut active: Vec<(usize, ProgressBar)> = (0..rxs.len().min(5))
            .map(|chain_idx| {
                let pb = multi.add(ProgressBar::new(total));
                pb.set_style(pb_style.clone());
                pb.set_prefix(format!("Chain {chain_idx}"));
                (chain_idx, pb)
            })
            .collect();
        let mut next_active = active.len();
        let mut n_finished = 0;
        let mut most_recent: Vec<Option<ChainStats>> = vec![None; rxs.len()];

        loop {
            for (i, rx) in rxs.iter().enumerate() {
                while let Ok(stats) = rx.recv_timeout(timeout_ms) {
                    most_recent[i] = Some(stats)
                }
            }

            let mut to_replace = vec![false; active.len()];
            let mut avg_p_accept = 0.0;
            let mut n_available_stats = 0.0;
            for (vec_idx, (i, pb)) in active.iter().enumerate() {
                if let Some(stats) = &most_recent[*i] {
                    pb.set_position(stats.n);
                    if stats.mean_depth > 0.0 {
                        pb.set_message(format!(
                            "p(accept)≈{:.2} depth≈{:.1}",
                            stats.p_accept, stats.mean_depth
                        ));
                    } else {
                        pb.set_message(format!("p(accept)≈{:.2}", stats.p_accept));
                    }
                    avg_p_accept += stats.p_accept;
                    n_available_stats += 1.0;

                    if stats.n == total {
                        to_replace[vec_idx] = true;
                        n_finished += 1;
                    }
                }
            }
            if n_available_stats > 0.0 {
                avg_p_accept /= n_available_stats;
            }

            let mut total_progress = 0;
            let mut total_divergent = 0;
            for stats in most_recent.iter().flatten() {
                total_progress += stats.n;
                total_divergent += stats.n_divergent;
            }
            global_pb.set_position(total_progress);
            global_pb.set_message(format!(
                "p(accept)≈{:.2} divergent={}",
                avg_p_accept, total_divergent
            ));

            let mut to_remove = vec![];
            for (i, replace) in to_replace.iter().enumerate() {
                if *replace && next_active < most_recent.len() {
                    let pb = multi.add(ProgressBar::new(total));
                    pb.set_style(pb_style.clone());
                    pb.set_prefix(format!("Chain {next_active}"));
                    active[i] = (next_active, pb);
                    next_active += 1;
                } else if *replace {
                    to_remove.push(i);
                }
            }

            to_remove.sort();
            for i in to_remove.iter().rev() {
                active.remove(*i);
            }

            if n_finished >= most_recent.len() {
                break;
            }
            std::thread::sleep(sleep_ms);
        }
    })
}

/// A trait for types that own multiple MCMC chains.
pub trait HasChains<S> {
    type Chain: MarkovChain<S> + Send;

    /// Returns a mutable reference to the vector of chains.
    fn chains_mut(&mut self) -> &mut Vec<Self::Chain>;
}

/// An extension trait for types that own multiple MCMC chains, providing
/// default methods to run all chains in parallel with or without progress
/// bars.
pub trait ChainRunner<T>: HasChains<T>
where
    T: ndarray::LinalgScalar + PartialEq + Send + num_traits::ToPrimitive,
{
    /// Runs all chains in parallel, discarding the first `n_discard`
    /// iterations (burn-in).
    ///
    /// Returns an `[n_chains, n_collect, D]` tensor.
    fn run(&mut self, n_collect: usize, n_discard: usize) -> Result<Array3<T>, ShapeError> {
        let results: Vec<Array2<T>> = self
            .chains_mut()
            .par_iter_mut()
            .map(|chain| run_chain(chain, n_collect, n_discard))
            .collect();
        let views: Vec<ArrayView2<T>> = results.iter().map(|x| x.view()).collect();
        let out: Array3<T> = stack(Axis(0), &views)?;
        Ok(out)
    }

    /// Runs all chains in parallel with progress bars, discarding the
    /// burn-in, and returns the collected sample together with aggregated
    /// run statistics.
    fn run_progress(
        &mut self,
        n_collect: usize,
        n_discard: usize,
    ) -> Result<(Array3<T>, RunStats), Box<dyn Error>> {
        let chains = self.chains_mut();

        let mut rxs: Vec<Receiver<ChainStats>> = vec![];
        let mut txs: Vec<Sender<ChainStats>> = vec![];
        (0..chains.len()).for_each(|_| {
            let (tx, rx) = mpsc::channel();
            rxs.push(rx);
            txs.push(tx);
        });

        let total: u64 = (n_collect + n_discard).try_into()?;
        let progress_handle = spawn_progress_thread(rxs, total);

        let results: Vec<(Array2<T>, ChainStats)> = thread::scope(|s| {
            let handles: Vec<thread::ScopedJoinHandle<(Array2<T>, ChainStats)>> = chains
                .iter_mut()
                .zip(txs)
                .map(|(chain, tx)| {
                    s.spawn(|| {
                        run_chain_progress(chain, n_collect, n_discard, tx)
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

        let views: Vec<ArrayView2<T>> = results.iter().map(|(x, _)| x.view()).collect();
        let sample: Array3<T> = stack(Axis(0), &views)?;

        if let Err(e) = progress_handle.join() {
            eprintln!("Progress bar thread emitted error message: {:?}", e);
        }

        let chain_stats: Vec<ChainStats> = results.iter().map(|(_, s)| s.clone()).collect();
        let run_stats = RunStats::from_chain_stats(&chain_stats);
        Ok((sample, run_stats))
    }
}

impl<T, R> ChainRunner<T> for R
where
    T: ndarray::LinalgScalar + Send + PartialEq + num_traits::ToPrimitive,
    R: HasChains<T>,
{
}

/// Generates `n` random initial positions from a standard normal
/// distribution, each of dimension `d`.
pub fn init<T>(n: usize, d: usize) -> Vec<Vec<T>>
where
    T: Float + FromPrimitive,
{
    let rng = SmallRng::seed_from_u64(rand::rng().random::<u64>());
    _init(n, d, rng)
}

/// Generates `n` pseudo-random vectors from the `d`-dimensional standard
/// normal distribution. This function calls [`init_with_seed`] with seed 42.
pub fn init_det<T>(n: usize, d: usize) -> Vec<Vec<T>>
where
    T: Float + FromPrimitive,
{
    init_with_seed(n, d, 42)
}

/// Same as [`init`] except this function returns a deterministic sample.
pub fn init_with_seed<T>(n: usize, d: usize, seed: u64) -> Vec<Vec<T>>
where
    T: Float + FromPrimitive,
{
    let rng = SmallRng::seed_from_u64(seed);
    _init(n, d, rng)
}

fn _init<T>(n: usize, d: usize, mut rng: SmallRng) -> Vec<Vec<T>>
where
    T: Float + FromPrimitive,
{
    (0..n)
        .map(|_| {
            (0..d)
                .map(|_| {
                    let obs: f64 = rng.sample(StandardNormal);
                    T::from_f64(obs).unwrap()
                })
                .collect()
        })
        .collect()
}
