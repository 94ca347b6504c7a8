//! Key hierarchy using HKDF-SHA256
//!
//! Every function here is deterministic: the same inputs always yield the same
//! key, which is what lets session and API-key requests for one user decrypt
//! the same conversations without ever storing a key.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::KeyError;

/// Size of every key in the hierarchy (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Maximum context length in bytes
pub const MAX_CONTEXT_LEN: usize = 128;

/// Label for deriving the master secret from the server secret
const MASTER_LABEL: &[u8] = b"chatsealMasterV1";

/// Label for deriving the user key from the master secret
const USER_KEY_LABEL: &[u8] = b"chatsealUserV1";

/// Label for per-conversation encryption keys
const CONVERSATION_LABEL: &[u8] = b"chatsealConversationV1";

/// Label for per-conversation integrity keys
const INTEGRITY_LABEL: &[u8] = b"chatsealIntegrityV1";

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            /// Wrap raw key bytes.
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            /// Raw key bytes.
            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "([REDACTED])"))
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }
    };
}

secret_key!(
    /// Per-user root secret, re-derived on demand and never persisted.
    MasterSecret
);

secret_key!(
    /// Intermediate key with no conversation context.
    ///
    /// Never used directly for encryption or MAC.
    UserKey
);

secret_key!(
    /// Per-conversation key used only for token AEAD.
    ConversationKey
);

secret_key!(
    /// Per-conversation key used only for the integrity chain.
    IntegrityKey
);

/// Derive a user's master secret from the server secret and the user's salt.
///
/// This is the single derivation path for every authentication method.
/// Session and API-key requests both land here so they always agree.
///
/// # Errors
///
/// - `EmptyServerSecret` / `EmptySalt`: an input was empty
pub fn derive_master_secret(
    server_secret: &[u8],
    user_salt: &[u8],
) -> Result<MasterSecret, KeyError> {
    if server_secret.is_empty() {
        return Err(KeyError::EmptyServerSecret);
    }
    if user_salt.is_empty() {
        return Err(KeyError::EmptySalt);
    }

    let hkdf = Hkdf::<Sha256>::new(Some(user_salt), server_secret);

    let mut bytes = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(MASTER_LABEL, &mut bytes) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(MasterSecret { bytes })
}

/// Derive the context-free user key from a master secret.
pub fn derive_user_key(master_secret: &MasterSecret) -> UserKey {
    UserKey { bytes: expand(master_secret.as_bytes(), USER_KEY_LABEL, b"") }
}

/// Derive the encryption key for one conversation.
///
/// # Errors
///
/// - `InvalidContext`: see [`validate_context`]
pub fn derive_conversation_key(
    user_key: &UserKey,
    context: &str,
) -> Result<ConversationKey, KeyError> {
    validate_context(context)?;
    let bytes = expand(user_key.as_bytes(), CONVERSATION_LABEL, context.as_bytes());
    Ok(ConversationKey { bytes })
}

/// Derive the integrity-chain key for one conversation.
///
/// # Errors
///
/// - `InvalidContext`: see [`validate_context`]
pub fn derive_integrity_key(user_key: &UserKey, context: &str) -> Result<IntegrityKey, KeyError> {
    validate_context(context)?;
    let bytes = expand(user_key.as_bytes(), INTEGRITY_LABEL, context.as_bytes());
    Ok(IntegrityKey { bytes })
}

/// Check that a context can scope a key.
///
/// Contexts are conversation identifiers: 1 to [`MAX_CONTEXT_LEN`] bytes of
/// ASCII alphanumerics, `-` or `_`.
///
/// # Errors
///
/// - `InvalidContext`: empty, too long, or contains other characters
pub fn validate_context(context: &str) -> Result<(), KeyError> {
    if context.is_empty() {
        return Err(KeyError::InvalidContext { reason: "context is empty".to_string() });
    }

    if context.len() > MAX_CONTEXT_LEN {
        return Err(KeyError::InvalidContext {
            reason: format!("context is {} bytes, limit is {MAX_CONTEXT_LEN}", context.len()),
        });
    }

    let allowed = |c: &char| c.is_ascii_alphanumeric() || *c == '-' || *c == '_';
    if let Some(bad) = context.chars().find(|c| !allowed(c)) {
        return Err(KeyError::InvalidContext {
            reason: format!("context contains disallowed character {bad:?}"),
        });
    }

    Ok(())
}

/// HKDF-Expand with info = label || len(context) || context.
///
/// The length prefix keeps (label, context) pairs unambiguous.
fn expand(ikm: &[u8; KEY_SIZE], label: &[u8], context: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);

    // Context length is bounded by MAX_CONTEXT_LEN, well under u16::MAX
    let mut info = Vec::with_capacity(label.len() + 2 + context.len());
    info.extend_from_slice(label);
    info.extend_from_slice(&(context.len() as u16).to_be_bytes());
    info.extend_from_slice(context);

    let mut okm = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(&info, &mut okm) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    okm
}

/// Both keys for one conversation.
///
/// The intermediate [`UserKey`] is dropped, and zeroized, before
/// [`derive`](Self::derive) returns. Dropping the bundle zeroizes both keys.
#[derive(Debug)]
pub struct ConversationKeys {
    encryption: ConversationKey,
    integrity: IntegrityKey,
}

impl ConversationKeys {
    /// Derive encryption and integrity keys for `context`.
    ///
    /// # Errors
    ///
    /// - `InvalidContext`: see [`validate_context`]
    pub fn derive(master_secret: &MasterSecret, context: &str) -> Result<Self, KeyError> {
        let user_key = derive_user_key(master_secret);
        let encryption = derive_conversation_key(&user_key, context)?;
        let integrity = derive_integrity_key(&user_key, context)?;
        drop(user_key);

        Ok(Self { encryption, integrity })
    }

    /// Key for token encryption.
    pub fn encryption(&self) -> &ConversationKey {
        &self.encryption
    }

    /// Key for the integrity chain.
    pub fn integrity(&self) -> &IntegrityKey {
        &self.integrity
    }
}
