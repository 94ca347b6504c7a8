//! Environment abstraction for deterministic testing.
//!
//! Decouples conversation logic from system resources (wall clock,
//! randomness). Production uses [`SystemEnv`](crate::SystemEnv); tests use
//! [`ManualEnv`] for reproducible timestamps, nonces and ids.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Abstract environment providing wall-clock time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion)
pub trait Environment: Clone + Send + Sync + 'static {
    /// Unix time in milliseconds, used for message timestamps.
    fn wall_clock_millis(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Uses cryptographically secure RNG in production; token nonces are
    ///   drawn from here
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u128`.
    ///
    /// Used for conversation ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Deterministic environment for tests and simulation.
///
/// The clock only moves when told to. Random bytes come from a `SplitMix64`
/// stream, so every call yields fresh bytes but runs are reproducible.
/// NOT secure; never use outside tests.
#[derive(Clone)]
pub struct ManualEnv {
    clock_ms: Arc<AtomicU64>,
    rng_state: Arc<AtomicU64>,
}

impl ManualEnv {
    /// Start the clock at `start_ms` and the RNG at `seed`.
    pub fn new(start_ms: u64, seed: u64) -> Self {
        Self {
            clock_ms: Arc::new(AtomicU64::new(start_ms)),
            rng_state: Arc::new(AtomicU64::new(seed)),
        }
    }

    /// Move the clock forward.
    pub fn advance_millis(&self, millis: u64) {
        self.clock_ms.fetch_add(millis, Ordering::SeqCst);
    }

    fn next_u64(&self) -> u64 {
        const GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

        let mut z = self.rng_state.fetch_add(GAMMA, Ordering::SeqCst).wrapping_add(GAMMA);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl Default for ManualEnv {
    fn default() -> Self {
        Self::new(1_700_000_000_000, 0)
    }
}

impl Environment for ManualEnv {
    fn wall_clock_millis(&self) -> u64 {
        self.clock_ms.load(Ordering::SeqCst)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let bytes = self.next_u64().to_be_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}
