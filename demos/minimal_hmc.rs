use ndarray::{arr1, Axis};
use parallel_nuts::core::ChainRunner;
use parallel_nuts::distributions::IsotropicGaussian;
use parallel_nuts::hmc::HmcSampler;

fn main() {
    let target = IsotropicGaussian::new(1.0);
    let initial_positions = vec![
        arr1(&[2.0_f64, 2.0, 2.0]),
        arr1(&[-2.0_f64, -2.0, -2.0]),
    ];

    // Step size 0.2, 10 leapfrog steps per proposal.
    let mut sampler = HmcSampler::new(target, initial_positions, 0.2, 10).set_seed(42);
    let sample = sampler.run(1000, 200).unwrap();

    let flat = sample.to_shape((2000, 3)).unwrap();
    println!("sample mean ≈ {}", flat.mean_axis(Axis(0)).unwrap());
    assert_eq!(sample.shape(), &[2, 1000, 3]);
}

#[cfg(test)]
mod tests {
    use super::main;

    #[test]
    fn test_main() {
        main();
    }
}
