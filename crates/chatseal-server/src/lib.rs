//! Chatseal conversation store.
//!
//! Stores chat conversations as ordered lists of encrypted tokens with a
//! keyed chain root over them, and implements the locked mutation protocol
//! (append, edit, delete) on top of a pluggable [`Storage`] backend.
//!
//! # Architecture
//!
//! Cryptography lives in [`chatseal_crypto`] and is pure. This crate adds the
//! stateful parts: per-request key material ([`RequestContext`]), storage
//! with per-conversation row locks, and best-effort signals to collaborators
//! ([`Notifier`]).
//!
//! # Components
//!
//! - [`ConversationService`]: mutation protocol and reads
//! - [`Storage`]: persistence trait, with [`MemoryStorage`], [`RedbStorage`]
//!   and [`ChaoticStorage`] for fault injection
//! - [`RequestContext`]: authenticated caller plus derived master secret
//! - [`SystemEnv`]: production environment (real clock, crypto RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
mod conversation;
pub mod env;
mod error;
pub mod notify;
pub mod storage;
mod system_env;

pub use auth::{AuthMethod, RequestContext, ServerSecret, generate_user_salt};
pub use config::{ConfigError, ServiceConfig};
pub use conversation::{CommitSummary, ConversationService, Draft};
pub use env::{Environment, ManualEnv};
pub use error::{ConversationError, ErrorKind};
pub use notify::{Notifier, RegenerationRequest, UsageEvent, UsageKind, spawn_usage_logger};
pub use storage::{
    ChaoticStorage, ConversationRecord, FaultTarget, MemoryStorage, RedbStorage, Storage,
    StorageError,
};
pub use system_env::SystemEnv;
