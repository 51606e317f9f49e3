use dp_release_core::noise::{confidence_interval, margin, perturb, scale};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

const SAMPLES: usize = 10_000;
const EPSILON: f64 = 0.5;
const TRUE_COUNT: i64 = 42;

#[test]
fn ninety_five_percent_intervals_bracket_the_true_count() {
    let mut rng = ChaCha20Rng::seed_from_u64(2024);
    let covered = (0..SAMPLES)
        .filter(|_| {
            let noisy = perturb(&mut rng, TRUE_COUNT, EPSILON).unwrap();
            confidence_interval(noisy, EPSILON, 0.95)
                .unwrap()
                .contains(TRUE_COUNT as f64)
        })
        .count();

    let coverage = covered as f64 / SAMPLES as f64;
    assert!(coverage >= 0.94, "coverage {coverage}");
}

#[test]
fn noise_is_centered_with_laplace_spread() {
    let mut rng = ChaCha20Rng::seed_from_u64(99);
    let noise: Vec<f64> = (0..SAMPLES)
        .map(|_| perturb(&mut rng, TRUE_COUNT, EPSILON).unwrap() - TRUE_COUNT as f64)
        .collect();

    let mean = noise.iter().sum::<f64>() / SAMPLES as f64;
    let mean_abs = noise.iter().map(|value| value.abs()).sum::<f64>() / SAMPLES as f64;
    let b = scale(EPSILON).unwrap();

    // E|X| = b for Laplace(0, b); std error of the mean is about 0.028 here.
    assert!(mean.abs() < 0.15, "mean {mean}");
    assert!((mean_abs - b).abs() < 0.15, "mean |noise| {mean_abs}");
}

#[test]
fn interval_width_shrinks_as_epsilon_grows() {
    let narrow = margin(2.0, 0.95).unwrap();
    let wide = margin(0.5, 0.95).unwrap();
    assert!(narrow < wide);
    assert!((wide / narrow - 4.0).abs() < 1e-12);
}
