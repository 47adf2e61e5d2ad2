//! Tests verifying the correctness of the static-trajectory HMC sampler on a
//! 2D Gaussian target.

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array1, Array2, ArrayView2, Axis};
    use parallel_nuts::core::ChainRunner;
    use parallel_nuts::distributions::Gaussian2D;
    use parallel_nuts::hmc::HmcSampler;

    const SAMPLE_SIZE: usize = 5_000;
    const BURNIN: usize = 1_000;
    const SEED: u64 = 42;

    fn covariance(sample: &ArrayView2<f64>) -> Array2<f64> {
        let n = sample.shape()[0] as f64;
        let mean: Array1<f64> = sample.mean_axis(Axis(0)).unwrap();
        let centered = sample.to_owned() - &mean;
        centered.t().dot(&centered) / (n - 1.0)
    }

    #[test]
    fn test_two_d_gaussian_hmc() {
        let target = Gaussian2D {
            mean: arr1(&[1.0, 2.0]),
            cov: arr2(&[[2.0, 1.0], [1.0, 2.0]]),
        };
        let positions = vec![arr1(&[8.0_f64, 8.0]), arr1(&[-6.0_f64, -4.0])];
        let mut sampler = HmcSampler::new(target.clone(), positions, 0.25, 12).set_seed(SEED);
        let sample = sampler.run(SAMPLE_SIZE, BURNIN).unwrap();
        assert_eq!(sample.shape(), &[2, SAMPLE_SIZE, 2]);

        let flat = sample.to_shape((2 * SAMPLE_SIZE, 2)).unwrap();
        let mean_mcmc = flat.mean_axis(Axis(0)).unwrap();
        let mean_diff = (&mean_mcmc - &target.mean).mapv(f64::abs);
        assert!(
            mean_diff[0] < 0.5 && mean_diff[1] < 0.5,
            "Mean deviation too large: {}",
            mean_diff
        );

        let cov_mcmc = covariance(&flat.view());
        let max_diff = (&cov_mcmc - &target.cov)
            .mapv(f64::abs)
            .iter()
            .cloned()
            .fold(0.0, f64::max);
        assert!(
            max_diff < 0.8,
            "Covariance deviation too large: {max_diff}\nestimated: {cov_mcmc}"
        );
    }
}
