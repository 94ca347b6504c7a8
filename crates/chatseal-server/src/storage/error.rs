//! Storage error types.
//!
//! Defines errors that can occur during storage operations:
//! - `NotFound`: Requested conversation doesn't exist
//! - `AlreadyExists`: Conversation id is taken
//! - `Conflict`: Record version moved under a conditional commit
//! - `Serialization`: Failed to encode/decode a record
//! - `Io`: Underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Conversation not found
    #[error("conversation not found: {conversation_id}")]
    NotFound {
        /// Conversation that was not found
        conversation_id: String,
    },

    /// Conversation id already in use
    #[error("conversation already exists: {conversation_id}")]
    AlreadyExists {
        /// Conversation that already exists
        conversation_id: String,
    },

    /// Record version conflict
    ///
    /// A commit names the version it was computed from. If the stored record
    /// has moved on, the commit is rejected and nothing is written.
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict {
        /// Version the writer observed
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
