//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations to test error handling and
//! recovery. Used for chaos testing to ensure a failed mutation never leaves
//! a partially written conversation behind.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{Arc, Mutex};

use super::{ConversationRecord, RowLock, Storage, StorageError};

/// Which operations may fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// Every storage operation
    All,
    /// Only `commit_conversation`
    Commits,
}

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but randomly fails
/// operations based on a configured failure rate. Injected failures happen
/// before delegation, so the inner store never sees a failed write. Uses
/// Arc<Mutex<>> for the RNG state, making it Clone and thread-safe.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    target: FaultTarget,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Number of injected failures
    injected: Arc<Mutex<usize>>,
}

/// Simple deterministic RNG for chaos injection
///
/// Uses linear congruential generator (LCG) for fast, deterministic randomness.
/// This ensures chaos tests are reproducible with the same seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }

    /// Check if we should fail (returns true with probability = `failure_rate`)
    fn should_fail(&mut self, failure_rate: f64) -> bool {
        self.next() < failure_rate
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    #[allow(clippy::panic)]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            target: FaultTarget::All,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            injected: Arc::new(Mutex::new(0)),
        }
    }

    /// Restrict failures to `target`.
    pub fn with_target(mut self, target: FaultTarget) -> Self {
        self.target = target;
        self
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        #[allow(clippy::expect_used)]
        *self.injected.lock().expect("injected mutex poisoned")
    }

    /// Roll for a failure on an operation of kind `commit`.
    fn inject(&self, commit: bool) -> Result<(), StorageError> {
        if self.target == FaultTarget::Commits && !commit {
            return Ok(());
        }

        #[allow(clippy::expect_used)]
        let fail =
            self.rng.lock().expect("ChaoticRng mutex poisoned").should_fail(self.failure_rate);

        if fail {
            #[allow(clippy::expect_used)]
            let mut injected = self.injected.lock().expect("injected mutex poisoned");
            *injected += 1;
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }

        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn create_conversation(
        &self,
        conversation_id: &str,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        self.inject(false)?;
        self.inner.create_conversation(conversation_id, record)
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        self.inject(false)?;
        self.inner.load_conversation(conversation_id)
    }

    fn lock_conversation(&self, conversation_id: &str) -> Result<RowLock, StorageError> {
        self.inject(false)?;
        self.inner.lock_conversation(conversation_id)
    }

    fn commit_conversation(
        &self,
        conversation_id: &str,
        expected_version: u64,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        self.inject(true)?;
        self.inner.commit_conversation(conversation_id, expected_version, record)
    }

    fn list_conversations(&self, owner: &str) -> Result<Vec<String>, StorageError> {
        self.inject(false)?;
        self.inner.list_conversations(owner)
    }
}
