//! Storage abstraction for conversation records
//!
//! Trait-based abstraction for persisting conversations. The trait is
//! synchronous (no async): every mutation is a short lock-load-commit cycle
//! and reads are single snapshot loads.

mod chaotic;
mod error;
mod memory;
mod redb;
mod row_lock;

pub use chaotic::{ChaoticStorage, FaultTarget};
pub use error::StorageError;
pub use memory::MemoryStorage;
pub use row_lock::{RowLock, RowLocks};
use chatseal_crypto::Token;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// Persisted state of one conversation.
///
/// Records are replaced whole: every mutation builds a new record with
/// `version + 1` and commits it conditionally on the version it was derived
/// from. Readers therefore always see a matching `(tokens, count, root)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// User ID that owns the conversation.
    pub owner: String,
    /// Encrypted messages in sequence order.
    pub tokens: Vec<Token>,
    /// Number of tokens. Always `tokens.len()`.
    pub count: u64,
    /// Lowercase hex chain root over `tokens`.
    pub root: String,
    /// Monotonic record version, starting at 0.
    pub version: u64,
    /// Tombstone flag; discarded conversations read as not found.
    pub deleted: bool,
    /// Unix timestamp (milliseconds) when the conversation was created.
    pub created_at_ms: u64,
}

impl ConversationRecord {
    /// Empty record at version 0.
    pub fn empty(owner: impl Into<String>, root: String, created_at_ms: u64) -> Self {
        Self {
            owner: owner.into(),
            tokens: Vec::new(),
            count: 0,
            root,
            version: 0,
            deleted: false,
            created_at_ms,
        }
    }

    /// Successor record holding `tokens` and `root`.
    pub fn successor(&self, tokens: Vec<Token>, root: String) -> Self {
        Self {
            owner: self.owner.clone(),
            count: tokens.len() as u64,
            tokens,
            root,
            version: self.version + 1,
            deleted: self.deleted,
            created_at_ms: self.created_at_ms,
        }
    }

    /// Total encoded token bytes.
    pub fn encrypted_bytes(&self) -> u64 {
        self.tokens.iter().map(|t| t.as_str().len() as u64).sum()
    }
}

/// Storage abstraction for conversation records
///
/// Must be Clone (shared by every service handle), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations share
/// internal state via Arc, so clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Insert a new conversation record.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if the id is taken, including by a tombstone
    fn create_conversation(
        &self,
        conversation_id: &str,
        record: &ConversationRecord,
    ) -> Result<(), StorageError>;

    /// Load the latest committed record.
    ///
    /// Returns `None` if the conversation doesn't exist. Tombstoned records
    /// are returned as stored; callers decide how to present them.
    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, StorageError>;

    /// Take the exclusive row lock for a conversation.
    ///
    /// Blocks while another guard holds the row. The row is released when
    /// the returned guard drops.
    fn lock_conversation(&self, conversation_id: &str) -> Result<RowLock, StorageError>;

    /// Replace a record, conditional on its current version.
    ///
    /// # Invariants
    ///
    /// - Pre: caller holds the row lock for `conversation_id`
    /// - Pre: `record.version == expected_version + 1`
    /// - Post: on error, the stored record is unchanged
    ///
    /// # Errors
    ///
    /// - `NotFound` if no record exists
    /// - `Conflict` if the stored version is not `expected_version`
    fn commit_conversation(
        &self,
        conversation_id: &str,
        expected_version: u64,
        record: &ConversationRecord,
    ) -> Result<(), StorageError>;

    /// List ids of live conversations owned by `owner`.
    ///
    /// Order is not guaranteed.
    fn list_conversations(&self, owner: &str) -> Result<Vec<String>, StorageError>;
}
