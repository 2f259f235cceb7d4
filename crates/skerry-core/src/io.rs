//! Randomness abstraction for deterministic testing
//!
//! TigerStyle: All randomness goes through `RngProvider`.
//!
//! The registry shuffles allocation candidates so that no replica is
//! favoured by identity order. Each registry owns its provider; there is no
//! process-wide generator.
//!
//! - `StdRngProvider`: Production - rand `StdRng` seeded from OS entropy
//! - `DeterministicRng`: Tests and seeded configs - ChaCha20, reproducible

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

// ============================================================================
// RNG Provider
// ============================================================================

/// Random number generator abstraction
///
/// All code that needs randomness MUST use this trait.
/// Never use `rand::thread_rng()` directly.
pub trait RngProvider: Send + Sync + std::fmt::Debug {
    /// Generate a random u64
    fn next_u64(&self) -> u64;

    /// Generate a random f64 in [0, 1)
    fn next_f64(&self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generate random u64 in range [min, max)
    fn gen_range(&self, min: u64, max: u64) -> u64 {
        assert!(min < max, "min must be less than max");
        let range = max - min;
        min + (self.next_u64() % range)
    }
}

/// Uniform Fisher-Yates shuffle driven by `rng`
pub fn shuffle<T>(rng: &dyn RngProvider, slice: &mut [T]) {
    for i in (1..slice.len()).rev() {
        let j = rng.gen_range(0, i as u64 + 1) as usize;
        debug_assert!(j <= i);
        slice.swap(i, j);
    }
}

/// Production RNG provider seeded from OS entropy
///
/// Not cryptographically meaningful here - used for fairness only.
#[derive(Debug)]
pub struct StdRngProvider {
    rng: Mutex<StdRng>,
}

impl Default for StdRngProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StdRngProvider {
    /// Create a new RNG provider seeded from OS entropy
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl RngProvider for StdRngProvider {
    fn next_u64(&self) -> u64 {
        self.rng.lock().gen()
    }
}

/// Deterministic random number generator
///
/// Uses ChaCha20 for reproducibility: the same seed yields the same
/// sequence of shuffles.
#[derive(Debug)]
pub struct DeterministicRng {
    /// The original seed (for logging/reproduction)
    seed: u64,
    rng: Mutex<ChaCha20Rng>,
}

impl DeterministicRng {
    /// Create a new deterministic RNG with the given seed
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    /// Create from environment variable DST_SEED or generate random seed
    ///
    /// Always logs the seed for reproducibility.
    pub fn from_env_or_random() -> Self {
        let seed = std::env::var("DST_SEED")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(rand::random);

        tracing::info!(seed = seed, "DST seed (set DST_SEED={} to replay)", seed);

        Self::new(seed)
    }

    /// Get the seed used to create this RNG
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RngProvider for DeterministicRng {
    fn next_u64(&self) -> u64 {
        self.rng.lock().gen()
    }
}

// ============================================================================
// Tests
// ============================================================================
