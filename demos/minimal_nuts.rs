use ndarray::arr1;
use parallel_nuts::distributions::Rosenbrock2D;
use parallel_nuts::sampler::NutsSampler;

fn main() {
    let target = Rosenbrock2D {
        a: 1.0_f64,
        b: 100.0,
    };
    let initial_positions = vec![
        arr1(&[1.0_f64, 2.0]),
        arr1(&[-1.0_f64, 1.0]),
        arr1(&[0.5_f64, 0.5]),
        arr1(&[2.0_f64, 4.0]),
    ];
    let mut sampler = NutsSampler::new(target, initial_positions, 0.05).set_seed(42);
    let n_collect = 400;
    let n_discard = 400;

    // Run with progress bars and return additional statistics
    let (sample, stats) = sampler.run_progress(n_collect, n_discard).unwrap();
    println!("Sample shape: {:?}", sample.shape());
    println!("{stats}");

    assert_eq!(sample.shape(), &[4, 400, 2]);
}
