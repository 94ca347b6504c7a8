//! Per-conversation row locks
//!
//! A mutation holds the row lock for its conversation from load to commit.
//! Other mutations on the same conversation block until the guard drops;
//! mutations on other conversations and all reads proceed.

#![allow(clippy::disallowed_types, reason = "Blocking lock table shared across threads")]

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use super::StorageError;

struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockTable {
    /// The held-set has no invariant a panicking holder can break, so a
    /// poisoned mutex is still usable.
    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Table of held row locks, shared by clones.
#[derive(Clone)]
pub struct RowLocks {
    table: Arc<LockTable>,
}

impl RowLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        let table = LockTable { held: Mutex::new(HashSet::new()), released: Condvar::new() };
        Self { table: Arc::new(table) }
    }

    /// Block until the row for `conversation_id` is free, then take it.
    ///
    /// # Errors
    ///
    /// Infallible for this table; the `Result` matches backends whose locks
    /// live in an external store.
    pub fn acquire(&self, conversation_id: &str) -> Result<RowLock, StorageError> {
        let mut held = self.table.held();
        while held.contains(conversation_id) {
            held = self.table.released.wait(held).unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(conversation_id.to_string());
        drop(held);

        Ok(RowLock { table: Arc::clone(&self.table), conversation_id: conversation_id.to_string() })
    }

    /// Whether some guard currently holds the row.
    pub fn is_locked(&self, conversation_id: &str) -> bool {
        self.table.held().contains(conversation_id)
    }
}

impl Default for RowLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on one conversation row. Released on drop.
#[must_use = "the row is released as soon as the guard is dropped"]
pub struct RowLock {
    table: Arc<LockTable>,
    conversation_id: String,
}

impl RowLock {
    /// Conversation this guard holds.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl fmt::Debug for RowLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowLock").field("conversation_id", &self.conversation_id).finish()
    }
}

impl Drop for RowLock {
    fn drop(&mut self) {
        let mut held = self.table.held();
        held.remove(&self.conversation_id);
        drop(held);
        self.table.released.notify_all();
    }
}
