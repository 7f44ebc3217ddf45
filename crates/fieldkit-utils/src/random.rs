//! Thread-local RNG used for weight initialization and test fixtures.
//!
//! Training outcomes are otherwise deterministic (fixed weights, `M = 0`
//! initial messages); randomness only enters here, at weight init time.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::ops::Range;

thread_local! {
    static TLS_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_os_rng());
}

/// Seeds the thread-local RNG, making subsequent draws on this thread
/// reproducible.
pub fn set_seed(seed: u64) {
    TLS_RNG.with(|cell| {
        *cell.borrow_mut() = SmallRng::seed_from_u64(seed);
    });
}

/// Runs `f` with the RNG temporarily reseeded, restoring the prior state
/// afterward. Used by tests that need a fixed draw without disturbing
/// whatever seed the caller already set.
pub fn scoped_seed<R>(seed: u64, f: impl FnOnce() -> R) -> R {
    TLS_RNG.with(|cell| {
        let original = {
            let mut rng = cell.borrow_mut();
            let original = rng.clone();
            *rng = SmallRng::seed_from_u64(seed);
            original
        };

        let result = f();
        *cell.borrow_mut() = original;
        result
    })
}

/// A uniform real in `[0, 1)`.
pub fn random() -> f64 {
    TLS_RNG.with(|cell| cell.borrow_mut().random())
}

/// A uniform real in the given range.
pub fn range(range: Range<f64>) -> f64 {
    TLS_RNG.with(|cell| cell.borrow_mut().random_range(range))
}

/// A standard-normal draw via the Box-Muller transform, matching the
/// `numpy.random.randn` initialization the reference implementation uses
/// for unary and edge weights.
pub fn gaussian(mean: f64, std_dev: f64) -> f64 {
    TLS_RNG.with(|cell| {
        let mut rng = cell.borrow_mut();
        let u1: f64 = rng.random();
        let u2: f64 = rng.random();
        let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z0
    })
}

/// `n` standard-normal draws, e.g. for initializing a weight matrix.
pub fn gaussian_vec(n: usize) -> Vec<f64> {
    (0..n).map(|_| gaussian(0.0, 1.0)).collect()
}
