//! Chatseal Cryptographic Core
//!
//! Key hierarchy, per-message token codec and the keyed integrity chain that
//! protect a stored conversation. Pure functions with deterministic outputs.
//! Callers provide nonces so tests can be deterministic.
//!
//! # Key Lifecycle
//!
//! A user's master secret is never stored. It is re-derived on every request
//! from the server secret and the user's persisted salt, then expanded into
//! per-conversation keys that only live for the duration of the call.
//!
//! ```text
//! (Server Secret, User Salt)
//!        │
//!        ▼ HKDF
//! Master Secret
//!        │
//!        ▼ HKDF
//! User Key
//!        │
//!        ├──▶ HKDF("conversation" ‖ context) → Conversation Key → AEAD tokens
//!        │
//!        └──▶ HKDF("integrity" ‖ context)    → Integrity Key    → HMAC chain
//! ```
//!
//! # Security
//!
//! Domain separation:
//! - Encryption and integrity keys use distinct HKDF labels
//! - Every label is versioned so a format change cannot collide with old keys
//!
//! Authenticity:
//! - XChaCha20-Poly1305 protects each token
//! - Associated data binds format version, compression marker, sequence
//!   number and conversation context, so tokens cannot be replayed elsewhere
//!
//! Sequence integrity:
//! - The chain root binds every token's exact bytes and position
//! - Any insertion, removal, reordering or bit flip changes the root
//!
//! Key hygiene:
//! - Every key type zeroizes itself on drop and redacts itself in `Debug`

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod chain;
pub mod codec;
pub mod error;
pub mod keys;

pub use chain::{
    ChainBuilder, ChainRoot, IntegrityIssue, IntegrityReport, SEQUENCE_BASELINE, compute_root,
    genesis_root, verify_integrity,
};
pub use codec::{
    Compression, DEFAULT_COMPRESSION_LEVEL, MAX_PAYLOAD_SIZE, Message, NONCE_SIZE, PackStats,
    PackedToken, Role, TOKEN_VERSION, Token, content_hash, pack, pack_with_level, peek_sequence,
    unpack,
};
pub use error::{CodecError, KeyError};
pub use keys::{
    ConversationKey, ConversationKeys, IntegrityKey, KEY_SIZE, MAX_CONTEXT_LEN, MasterSecret,
    UserKey, derive_conversation_key, derive_integrity_key, derive_master_secret, derive_user_key,
    validate_context,
};
