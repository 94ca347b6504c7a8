//! Caller identity and key material
//!
//! Authentication itself happens upstream. By the time a request reaches the
//! conversation service it is a user id plus that user's salt; this module
//! turns those into a [`RequestContext`] holding the user's master secret.
//! Session and API-key requests take the same derivation path, so both can
//! read every conversation the user owns.

use std::fmt;

use chatseal_crypto::{MasterSecret, derive_master_secret};
use zeroize::Zeroize;

use crate::{env::Environment, error::ConversationError};

/// Minimum server secret length in bytes
pub const MIN_SERVER_SECRET_LEN: usize = 32;

/// Length of generated user salts in bytes
pub const USER_SALT_LEN: usize = 16;

/// Deployment-wide secret every master secret is derived from.
///
/// Zeroized on drop.
pub struct ServerSecret {
    bytes: Vec<u8>,
}

impl ServerSecret {
    /// Wrap raw secret bytes.
    ///
    /// # Errors
    ///
    /// - `Authentication`: shorter than [`MIN_SERVER_SECRET_LEN`]
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ConversationError> {
        if bytes.len() < MIN_SERVER_SECRET_LEN {
            return Err(ConversationError::Authentication(format!(
                "server secret is {} bytes, need at least {MIN_SERVER_SECRET_LEN}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Parse a hex-encoded secret.
    ///
    /// # Errors
    ///
    /// - `Authentication`: not hex, or too short
    pub fn from_hex(text: &str) -> Result<Self, ConversationError> {
        let bytes = hex::decode(text.trim()).map_err(|e| {
            ConversationError::Authentication(format!("server secret is not hex: {e}"))
        })?;
        Self::from_bytes(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerSecret([REDACTED])")
    }
}

impl Drop for ServerSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// How the caller authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Interactive session
    Session,
    /// Programmatic API key
    ApiKey,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::ApiKey => f.write_str("api_key"),
        }
    }
}

/// Authenticated caller of one request.
///
/// Lives for one request. The master secret it carries is zeroized when the
/// context drops.
#[derive(Debug)]
pub struct RequestContext {
    user_id: String,
    method: AuthMethod,
    master_secret: MasterSecret,
}

impl RequestContext {
    /// Derive the caller's master secret and build a context.
    ///
    /// # Errors
    ///
    /// - `Authentication`: empty user id or salt
    pub fn resolve(
        server_secret: &ServerSecret,
        user_id: &str,
        user_salt: &[u8],
        method: AuthMethod,
    ) -> Result<Self, ConversationError> {
        if user_id.is_empty() {
            return Err(ConversationError::Authentication("user id is empty".to_string()));
        }
        if user_salt.is_empty() {
            return Err(ConversationError::Authentication(format!(
                "user {user_id} has no key salt"
            )));
        }

        let master_secret = derive_master_secret(server_secret.as_bytes(), user_salt)?;

        Ok(Self { user_id: user_id.to_string(), method, master_secret })
    }

    /// Authenticated user id.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// How the caller authenticated.
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub(crate) fn master_secret(&self) -> &MasterSecret {
        &self.master_secret
    }
}

/// Fresh random salt for a new user.
pub fn generate_user_salt<E: Environment>(env: &E) -> [u8; USER_SALT_LEN] {
    let mut salt = [0u8; USER_SALT_LEN];
    env.random_bytes(&mut salt);
    salt
}
