use ndarray::{arr1, arr2, Axis};
use parallel_nuts::distributions::Gaussian2D;
use parallel_nuts::nuts::NutsOptions;
use parallel_nuts::sampler::NutsSampler;

fn main() {
    let target = Gaussian2D {
        mean: arr1(&[1.0_f64, -1.0]),
        cov: arr2(&[[2.0, 0.5], [0.5, 1.0]]),
    };

    // One chain whose trajectories are built speculatively on two workers:
    // the forward and backward sweeps run concurrently, and work past the
    // eventual stopping point is discarded.
    let mut sampler = NutsSampler::speculative(target, vec![arr1(&[0.0_f64, 0.0])], 0.3, 2)
        .expect("building the worker pool")
        .with_options(NutsOptions {
            max_depth: 10,
            max_delta_energy: 1000.0,
        })
        .set_seed(42);

    let sample = sampler.run(2000, 500).unwrap();
    let flat = sample.to_shape((2000, 2)).unwrap();
    println!("posterior mean ≈ {}", flat.mean_axis(Axis(0)).unwrap());

    let chain = &sampler.chains[0];
    if let Some(t) = chain.last_transition() {
        println!(
            "last transition: depth={} n_leapfrog={} divergent={} accept≈{:.2}",
            t.depth, t.n_leapfrog, t.divergent, t.sample.accept_prob
        );
    }
}
