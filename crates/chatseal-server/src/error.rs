//! Conversation service error types.
//!
//! Every public operation fails with a [`ConversationError`]. Each variant is
//! one externally visible kind:
//! - Caller problems (`Authentication`, `Validation`, `NotFound`)
//! - Stored data problems (`Decryption`, `Integrity`)
//! - Contention and infrastructure (`Conflict`, `Internal`)

use std::fmt;

use chatseal_crypto::{CodecError, KeyError};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from conversation operations.
///
/// A failed mutation never changes the persisted record.
#[derive(Debug, Error)]
pub enum ConversationError {
    /// Caller identity could not be turned into key material.
    ///
    /// Empty user id, missing salt, or unusable server secret. Fatal for the
    /// request.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Request is malformed.
    ///
    /// Bad conversation id, empty or oversized batch, oversized content, or
    /// an appended token that does not continue the sequence.
    #[error("invalid request: {0}")]
    Validation(String),

    /// A stored or submitted token failed to decode.
    ///
    /// Carries the index of the failing token and its claimed sequence when
    /// the header was readable.
    #[error("token {index} (sequence {sequence:?}) failed to decode: {source}")]
    Decryption {
        /// Position in the token list
        index: usize,
        /// Sequence from the token header, if readable
        sequence: Option<u64>,
        /// Codec failure
        source: CodecError,
    },

    /// Stored chain root does not match the stored tokens.
    ///
    /// The record was modified outside the mutation protocol. Mutations
    /// refuse to build on it.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Conversation or message does not exist for this caller.
    ///
    /// Conversations owned by another user and discarded conversations are
    /// reported the same way.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conversation changed or was created concurrently.
    ///
    /// Transient - retry the whole operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage or runtime failure.
    ///
    /// May be transient (I/O errors) or permanent (corrupt record encoding).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Externally visible error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ConversationError::Authentication`]
    Authentication,
    /// See [`ConversationError::Validation`]
    Validation,
    /// See [`ConversationError::Decryption`]
    Decryption,
    /// See [`ConversationError::Integrity`]
    Integrity,
    /// See [`ConversationError::NotFound`]
    NotFound,
    /// See [`ConversationError::Conflict`]
    Conflict,
    /// See [`ConversationError::Internal`]
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Decryption => "decryption",
            Self::Integrity => "integrity",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl ConversationError {
    /// Kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Decryption { .. } => ErrorKind::Decryption,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Internal)
    }

    pub(crate) fn not_found(conversation_id: &str) -> Self {
        Self::NotFound(format!("conversation {conversation_id}"))
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

impl From<StorageError> for ConversationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { conversation_id } => Self::not_found(&conversation_id),
            StorageError::AlreadyExists { conversation_id } => {
                Self::Conflict(format!("conversation {conversation_id} already exists"))
            },
            StorageError::Conflict { expected, actual } => {
                Self::Conflict(format!("record version moved from {expected} to {actual}"))
            },
            StorageError::Serialization(reason) | StorageError::Io(reason) => {
                Self::Internal(reason)
            },
        }
    }
}

impl From<KeyError> for ConversationError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::EmptyServerSecret | KeyError::EmptySalt => {
                Self::Authentication(err.to_string())
            },
            KeyError::InvalidContext { .. } => Self::Validation(err.to_string()),
        }
    }
}
