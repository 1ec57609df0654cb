//! Seeded delays for interleaving tests

use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Source of random pauses, reproducible from its seed
pub struct Jitter {
    rng: Mutex<StdRng>,
    range: Option<Uniform<u64>>,
}

impl Jitter {
    /// Pauses uniformly drawn from `[min_ms, max_ms]`
    pub fn new(seed: u64, min_ms: u64, max_ms: u64) -> Self {
        let (low, high) = if min_ms <= max_ms {
            (min_ms, max_ms)
        } else {
            (max_ms, min_ms)
        };
        Jitter {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            range: Some(Uniform::new_inclusive(low, high)),
        }
    }

    /// No pauses at all
    pub fn none() -> Self {
        Jitter {
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            range: None,
        }
    }

    pub fn sample(&self) -> Duration {
        match &self.range {
            Some(range) => Duration::from_millis(range.sample(&mut *self.rng.lock())),
            None => Duration::ZERO,
        }
    }

    /// Sleep for one sample; yields even when the sample is zero
    pub async fn pause(&self) {
        let delay = self.sample();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
