//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` is the production implementation of the Environment trait using
//! the real wall clock and the OS cryptographic RNG. Runs are not
//! reproducible, but randomness is security grade.

use crate::env::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Security
///
/// The RNG uses getrandom which provides OS-level cryptographic randomness
/// (e.g., /dev/urandom on Linux, `BCryptGenRandom` on Windows). Suitable for
/// token nonces, user salts and conversation ids.
///
/// # Panics
///
/// Panics if the OS RNG fails. A server without functioning cryptographic
/// randomness cannot pack tokens safely, and continuing would risk nonce
/// reuse.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_millis(&self) -> u64 {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)");
        elapsed.as_millis() as u64
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - server cannot operate securely");
    }
}
