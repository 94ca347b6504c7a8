//! Error types for key derivation and the token codec

use thiserror::Error;

/// Errors from key derivation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Server secret was empty
    #[error("server secret must not be empty")]
    EmptyServerSecret,

    /// User salt was empty
    #[error("user salt must not be empty")]
    EmptySalt,

    /// Context string cannot scope a key
    #[error("invalid context: {reason}")]
    InvalidContext {
        /// Why the context was rejected
        reason: String,
    },
}

/// Errors from packing or unpacking a token
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Token bytes or decrypted payload do not parse.
    ///
    /// Raised before decryption for encoding, version and length problems,
    /// and after decryption when the payload is not a valid message.
    #[error("malformed token: {reason}")]
    Format {
        /// What was wrong with the token
        reason: String,
    },

    /// Authentication tag mismatch (wrong key, wrong context, or tampering)
    #[error("decryption failed: authentication tag mismatch")]
    Decryption,

    /// Decrypted content does not match its recorded hash
    #[error("content hash mismatch for sequence {sequence}")]
    ContentHashMismatch {
        /// Sequence number of the offending message
        sequence: u64,
    },

    /// Serialized message exceeds the payload limit
    #[error("payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Serialized size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Key derivation input was rejected
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl CodecError {
    /// Returns true if this error implies tampering or a key mismatch rather
    /// than a caller mistake.
    pub fn is_tampering(&self) -> bool {
        match self {
            Self::Decryption | Self::ContentHashMismatch { .. } => true,

            Self::Format { .. } | Self::PayloadTooLarge { .. } | Self::Key(_) => false,
        }
    }

    pub(crate) fn format(reason: impl Into<String>) -> Self {
        Self::Format { reason: reason.into() }
    }
}
