//! # Parallel NUTS
//!
//! A Rust library for **No-U-Turn-Sampler (NUTS)** Hamiltonian Monte Carlo
//! with multinomial trajectory sampling, plus a plain **HMC** sampler built
//! on the same core. Trajectories can be grown by a sequential driver or by
//! an experimental **speculative scheduler** that extends the forward and
//! backward sweep of one trajectory concurrently on a worker pool.
//!
//! ## Getting started
//!
//! Provide a target distribution by implementing the
//! [`HamiltonianTarget`](hamiltonian::HamiltonianTarget) trait (log-density
//! plus in-place gradient), pick initial positions, and run:
//!
//! ```rust
//! use ndarray::{arr1, arr2, Axis};
//! use parallel_nuts::distributions::Gaussian2D;
//! use parallel_nuts::sampler::NutsSampler;
//!
//! // 2D Gaussian with full covariance.
//! let target = Gaussian2D {
//!     mean: arr1(&[0.0, 0.0]),
//!     cov: arr2(&[[4.0, 2.0], [2.0, 3.0]]),
//! };
//!
//! // Two chains, step size 0.25, fixed seed.
//! let positions = vec![arr1(&[0.0_f64, 0.0]), arr1(&[1.0, 1.0])];
//! let mut sampler = NutsSampler::new(target, positions, 0.25).set_seed(42);
//!
//! // 200 burn-in + 200 collected transitions per chain.
//! let sample = sampler.run(200, 200).unwrap();
//! assert_eq!(sample.shape(), &[2, 200, 2]);
//! println!("posterior mean ≈ {}", sample.mean_axis(Axis(1)).unwrap());
//! ```
//!
//! ## Custom targets
//!
//! ```rust
//! use ndarray::{arr1, Array1};
//! use parallel_nuts::hamiltonian::HamiltonianTarget;
//! use parallel_nuts::sampler::NutsChain;
//!
//! /// Standard normal in any dimension.
//! struct StdNormal;
//!
//! impl HamiltonianTarget<Array1<f64>> for StdNormal {
//!     fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
//!         grad.assign(&position.mapv(|x| -x));
//!         -0.5 * position.dot(position)
//!     }
//! }
//!
//! let mut chain = NutsChain::new(StdNormal, arr1(&[1.0, -1.0]), 0.3).set_seed(7);
//! let transition = chain.step_transition();
//! assert!(transition.sample.accept_prob >= 0.0 && transition.sample.accept_prob <= 1.0);
//! ```
//!
//! ## Speculative trajectory building
//!
//! The speculative driver precomputes the transition's direction plan, then
//! extends the two time-directions concurrently as a task graph: one chain
//! of "extend" tasks per direction, and a totally ordered chain of "check"
//! tasks that commits results in logical order and stops the trajectory on
//! a U-turn or divergence. Work scheduled past the stopping point is wasted
//! rather than wrong; with a single worker the schedule degenerates to the
//! sequential driver's order exactly.
//!
//! ```rust
//! use ndarray::arr1;
//! use parallel_nuts::distributions::IsotropicGaussian;
//! use parallel_nuts::sampler::NutsChain;
//!
//! let mut chain = NutsChain::speculative(
//!     IsotropicGaussian::new(1.0),
//!     arr1(&[0.5_f64, -0.5]),
//!     0.3,
//!     2, // workers
//! )
//! .unwrap()
//! .set_seed(42);
//! for _ in 0..10 {
//!     chain.step_transition();
//! }
//! ```
//!
//! ## Features
//! - **Multinomial NUTS** with the generalized no-U-turn criterion over a
//!   diagonal Euclidean metric
//! - **Sequential and speculative** trajectory drivers behind one trait
//! - **Parallel chains** via Rayon, with progress bars reporting acceptance,
//!   divergences and tree depth
//! - **Static-trajectory HMC** sharing the same phase-space core

pub mod core;
pub mod distributions;
pub mod euclidean;
mod graph;
pub mod hamiltonian;
pub mod hmc;
pub mod integrator;
pub mod math;
pub mod nuts;
pub mod parallel;
pub mod sampler;
pub mod stats;
pub mod tree;
