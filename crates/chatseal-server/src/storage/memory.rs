#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::{ConversationRecord, RowLock, RowLocks, Storage, StorageError};

/// In-memory storage implementation for testing and simulation
///
/// Records are held as `Arc<ConversationRecord>` and replaced whole on commit,
/// so a load clones one consistent record even while a commit is pending.
/// Thread-safe through Mutex, but uses `lock().expect()` which will panic if
/// the mutex is poisoned - acceptable for test code.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
    locks: RowLocks,
}

struct MemoryStorageInner {
    /// Latest committed record per conversation
    conversations: HashMap<String, Arc<ConversationRecord>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner { conversations: HashMap::new() })),
            locks: RowLocks::new(),
        }
    }

    /// Number of stored conversations, tombstones included.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned (a thread panicked while
    /// holding the lock). This is acceptable for test/simulation code.
    #[allow(clippy::expect_used)]
    pub fn conversation_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").conversations.len()
    }

    /// Whether a mutation currently holds the row lock.
    pub fn is_locked(&self, conversation_id: &str) -> bool {
        self.locks.is_locked(conversation_id)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn create_conversation(
        &self,
        conversation_id: &str,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if inner.conversations.contains_key(conversation_id) {
            return Err(StorageError::AlreadyExists {
                conversation_id: conversation_id.to_string(),
            });
        }

        inner.conversations.insert(conversation_id.to_string(), Arc::new(record.clone()));
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        // Hold the map lock only long enough to clone the Arc
        let snapshot = {
            let inner = self.inner.lock().expect("Mutex poisoned");
            inner.conversations.get(conversation_id).cloned()
        };

        Ok(snapshot.map(|record| (*record).clone()))
    }

    fn lock_conversation(&self, conversation_id: &str) -> Result<RowLock, StorageError> {
        self.locks.acquire(conversation_id)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn commit_conversation(
        &self,
        conversation_id: &str,
        expected_version: u64,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        debug_assert_eq!(record.version, expected_version + 1);
        debug_assert_eq!(record.count, record.tokens.len() as u64);

        let replacement = Arc::new(record.clone());
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let current = inner.conversations.get_mut(conversation_id).ok_or_else(|| {
            StorageError::NotFound { conversation_id: conversation_id.to_string() }
        })?;

        if current.version != expected_version {
            return Err(StorageError::Conflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        *current = replacement;
        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned. This is acceptable for test
    /// code.
    #[allow(clippy::expect_used)]
    fn list_conversations(&self, owner: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .conversations
            .iter()
            .filter(|(_, record)| record.owner == owner && !record.deleted)
            .map(|(id, _)| id.clone())
            .collect())
    }
}
