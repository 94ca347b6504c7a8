//! Conversation service
//!
//! Owns the mutation protocol. Every mutation is one lock cycle:
//!
//! ```text
//! lock row -> load record -> check root -> build new token list
//!          -> extend or replay root -> conditional commit -> unlock -> signal
//! ```
//!
//! The row lock is an RAII guard, so it is released on every exit path.
//! Nothing is written until the final commit, and the commit is conditional
//! on the version loaded under the lock, so a failed mutation leaves the
//! stored record exactly as it was. Reads take no lock and see one whole
//! committed record.
//!
//! Edit and delete are truncating: the target message and everything after
//! it are discarded. Edit then appends a replacement with the same sequence.

use chatseal_crypto::{
    ChainBuilder, ChainRoot, ConversationKeys, IntegrityReport, Message, NONCE_SIZE, Role,
    SEQUENCE_BASELINE, Token, compute_root, genesis_root, pack_with_level, peek_sequence, unpack,
    validate_context, verify_integrity,
};

use crate::{
    auth::RequestContext,
    config::{ConfigError, ServiceConfig},
    env::Environment,
    error::ConversationError,
    notify::{Notifier, RegenerationRequest, UsageEvent, UsageKind},
    storage::{ConversationRecord, Storage},
};

/// Unencrypted message to be packed and appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Author
    pub role: Role,
    /// Plaintext content
    pub content: String,
}

impl Draft {
    /// Build a draft.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }
}

/// State of a conversation after a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Number of messages
    pub count: u64,
    /// Hex chain root
    pub root: String,
    /// Record version
    pub version: u64,
}

/// Result of one lock cycle.
struct Mutation {
    record: ConversationRecord,
    previous_count: u64,
}

impl Mutation {
    fn summary(&self) -> CommitSummary {
        CommitSummary {
            count: self.record.count,
            root: self.record.root.clone(),
            version: self.record.version,
        }
    }
}

/// Encrypted conversation store.
///
/// Cheap to share: wrap in an `Arc` and call from any thread. Mutations on
/// one conversation serialize on its row lock; everything else runs in
/// parallel.
pub struct ConversationService<S: Storage, E: Environment> {
    storage: S,
    env: E,
    config: ServiceConfig,
    notifier: Notifier,
}

impl<S: Storage, E: Environment> ConversationService<S, E> {
    /// Create a service over `storage`.
    ///
    /// # Errors
    ///
    /// Returns the first unusable limit in `config`.
    pub fn new(
        storage: S,
        env: E,
        config: ServiceConfig,
        notifier: Notifier,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { storage, env, config, notifier })
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Active configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Create an empty conversation owned by the caller.
    ///
    /// Generates a random id when `conversation_id` is `None`.
    ///
    /// # Errors
    ///
    /// - `Validation`: id is not a valid conversation id
    /// - `Conflict`: id already exists
    pub fn create_conversation(
        &self,
        ctx: &RequestContext,
        conversation_id: Option<&str>,
    ) -> Result<String, ConversationError> {
        let conversation_id = match conversation_id {
            Some(id) => id.to_string(),
            None => format!("{:032x}", self.env.random_u128()),
        };

        let keys = derive_keys(ctx, &conversation_id)?;
        let record = ConversationRecord::empty(
            ctx.user_id(),
            genesis_root(keys.integrity()).to_hex(),
            self.env.wall_clock_millis(),
        );

        self.storage.create_conversation(&conversation_id, &record)?;

        tracing::info!(
            conversation_id = %conversation_id,
            owner = ctx.user_id(),
            method = %ctx.method(),
            "Created conversation"
        );
        self.notifier.record_usage(UsageEvent {
            owner: ctx.user_id().to_string(),
            conversation_id: conversation_id.clone(),
            kind: UsageKind::Created,
            tokens_added: 0,
            tokens_removed: 0,
            encrypted_bytes: 0,
        });

        Ok(conversation_id)
    }

    /// Append already-packed tokens.
    ///
    /// Every token must decrypt under this conversation's key and carry the
    /// next expected sequence, in order. Decode failures report the token's
    /// position within `tokens`.
    ///
    /// # Errors
    ///
    /// - `Validation`: empty or oversized batch, malformed token,
    ///   out-of-order sequence, oversized content
    /// - `Decryption`: a token fails authentication under this conversation
    /// - `NotFound`, `Integrity`, `Conflict`, `Internal`: see
    ///   [`ConversationError`]
    pub fn append(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
        tokens: Vec<Token>,
    ) -> Result<CommitSummary, ConversationError> {
        self.check_batch(tokens.len())?;
        let added = tokens.len() as u64;

        let mutation = self.mutate(ctx, conversation_id, |current, keys| {
            let next_sequence = SEQUENCE_BASELINE + current.tokens.len() as u64;

            for (index, token) in tokens.iter().enumerate() {
                let message = decode_submitted(token, index, keys, conversation_id)?;
                let expected = next_sequence + index as u64;

                if message.sequence != expected {
                    return Err(ConversationError::validation(format!(
                        "token {index} has sequence {}, expected {expected}",
                        message.sequence
                    )));
                }
                self.check_content(&message.content)?;
            }

            let mut next = current.tokens.clone();
            next.extend(tokens);
            Ok(next)
        })?;

        tracing::info!(
            conversation_id,
            appended = added,
            count = mutation.record.count,
            version = mutation.record.version,
            "Appended tokens"
        );
        self.record_usage(ctx, conversation_id, UsageKind::Appended, added, &mutation);

        Ok(mutation.summary())
    }

    /// Pack drafts with the next sequences and append them.
    ///
    /// Every draft in the batch gets the same fresh timestamp.
    ///
    /// # Errors
    ///
    /// As [`append`](Self::append), except `Decryption`.
    pub fn append_messages(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
        drafts: &[Draft],
    ) -> Result<CommitSummary, ConversationError> {
        self.check_batch(drafts.len())?;
        for draft in drafts {
            self.check_content(&draft.content)?;
        }
        let added = drafts.len() as u64;

        let mutation = self.mutate(ctx, conversation_id, |current, keys| {
            let next_sequence = SEQUENCE_BASELINE + current.tokens.len() as u64;
            let timestamp_ms = self.env.wall_clock_millis();

            let mut next = current.tokens.clone();
            for (offset, draft) in drafts.iter().enumerate() {
                let message = Message::new(
                    draft.role,
                    draft.content.as_str(),
                    next_sequence + offset as u64,
                    timestamp_ms,
                );
                next.push(self.pack(keys, conversation_id, &message)?);
            }
            Ok(next)
        })?;

        tracing::info!(
            conversation_id,
            appended = added,
            count = mutation.record.count,
            version = mutation.record.version,
            "Appended messages"
        );
        self.record_usage(ctx, conversation_id, UsageKind::Appended, added, &mutation);

        Ok(mutation.summary())
    }

    /// Replace message `sequence` and discard every later message.
    ///
    /// The replacement keeps the original role and sequence and gets a fresh
    /// timestamp. With `regenerate`, a regeneration request is sent after the
    /// commit and the lock release; it is best-effort and cannot fail the
    /// edit.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such conversation or message
    /// - `Validation`: oversized content
    /// - `Decryption`, `Integrity`, `Conflict`, `Internal`: see
    ///   [`ConversationError`]
    pub fn edit(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
        sequence: u64,
        new_content: &str,
        regenerate: bool,
    ) -> Result<CommitSummary, ConversationError> {
        self.check_content(new_content)?;

        let mutation = self.mutate(ctx, conversation_id, |current, keys| {
            let (index, original) = locate(current, keys, conversation_id, sequence)?;

            let replacement =
                Message::new(original.role, new_content, sequence, self.env.wall_clock_millis());

            let mut next = current.tokens[..index].to_vec();
            next.push(self.pack(keys, conversation_id, &replacement)?);
            Ok(next)
        })?;

        tracing::info!(
            conversation_id,
            sequence,
            discarded = mutation.previous_count - mutation.record.count,
            version = mutation.record.version,
            regenerate,
            "Edited message"
        );
        self.record_usage(ctx, conversation_id, UsageKind::Edited, 1, &mutation);

        if regenerate {
            self.notifier.request_regeneration(RegenerationRequest {
                owner: ctx.user_id().to_string(),
                conversation_id: conversation_id.to_string(),
                from_sequence: sequence,
            });
        }

        Ok(mutation.summary())
    }

    /// Remove message `sequence` and every later message.
    ///
    /// Never requests regeneration.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such conversation or message
    /// - `Decryption`, `Integrity`, `Conflict`, `Internal`: see
    ///   [`ConversationError`]
    pub fn delete(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
        sequence: u64,
    ) -> Result<CommitSummary, ConversationError> {
        let mutation = self.mutate(ctx, conversation_id, |current, keys| {
            let (index, _) = locate(current, keys, conversation_id, sequence)?;
            Ok(current.tokens[..index].to_vec())
        })?;

        tracing::info!(
            conversation_id,
            sequence,
            removed = mutation.previous_count - mutation.record.count,
            version = mutation.record.version,
            "Deleted messages"
        );
        self.record_usage(ctx, conversation_id, UsageKind::Deleted, 0, &mutation);

        Ok(mutation.summary())
    }

    /// Tombstone a conversation and drop its tokens.
    ///
    /// Afterwards every operation on it reports `NotFound`.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such conversation for this caller
    /// - `Conflict`: already discarded
    pub fn discard_conversation(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
    ) -> Result<(), ConversationError> {
        let keys = derive_keys(ctx, conversation_id)?;

        let _row = self.storage.lock_conversation(conversation_id)?;

        let current = match self.storage.load_conversation(conversation_id)? {
            Some(record) if record.owner == ctx.user_id() => record,
            Some(_) | None => return Err(ConversationError::not_found(conversation_id)),
        };

        if current.deleted {
            return Err(ConversationError::Conflict(format!(
                "conversation {conversation_id} is already discarded"
            )));
        }

        let mut tombstone = current.successor(Vec::new(), genesis_root(keys.integrity()).to_hex());
        tombstone.deleted = true;

        self.storage.commit_conversation(conversation_id, current.version, &tombstone)?;

        tracing::info!(
            conversation_id,
            discarded = current.count,
            version = tombstone.version,
            "Discarded conversation"
        );
        self.notifier.record_usage(UsageEvent {
            owner: ctx.user_id().to_string(),
            conversation_id: conversation_id.to_string(),
            kind: UsageKind::Discarded,
            tokens_added: 0,
            tokens_removed: current.count,
            encrypted_bytes: 0,
        });

        Ok(())
    }

    /// Decrypt every message of a conversation, in order.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such conversation for this caller
    /// - `Decryption`: a stored token does not decode
    pub fn load_messages(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
    ) -> Result<Vec<Message>, ConversationError> {
        let keys = derive_keys(ctx, conversation_id)?;
        let record = self.load_owned(ctx, conversation_id)?;

        record
            .tokens
            .iter()
            .enumerate()
            .map(|(index, token)| decode(token, index, &keys, conversation_id))
            .collect()
    }

    /// Check a conversation's tokens against its stored root.
    ///
    /// A failed check is a report with `valid == false`, not an error.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such conversation for this caller
    /// - `Integrity`: stored root is unreadable
    pub fn verify(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
    ) -> Result<IntegrityReport, ConversationError> {
        let keys = derive_keys(ctx, conversation_id)?;
        let record = self.load_owned(ctx, conversation_id)?;
        let expected = stored_root(&record)?;

        let report = verify_integrity(
            &record.tokens,
            &expected,
            keys.encryption(),
            keys.integrity(),
            conversation_id,
        );

        if report.valid {
            tracing::debug!(conversation_id, count = record.count, "Integrity verified");
        } else {
            tracing::warn!(
                conversation_id,
                issues = report.errors.len(),
                last_valid_sequence = ?report.last_valid_sequence,
                "Integrity verification failed"
            );
        }

        Ok(report)
    }

    /// Latest committed record, as stored.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such conversation for this caller
    pub fn snapshot(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
    ) -> Result<ConversationRecord, ConversationError> {
        validate_context(conversation_id)?;
        self.load_owned(ctx, conversation_id)
    }

    /// Ids of the caller's live conversations, sorted.
    pub fn list_conversations(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<String>, ConversationError> {
        let mut ids = self.storage.list_conversations(ctx.user_id())?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Run one lock cycle.
    ///
    /// `build` sees the current record and returns the complete new token
    /// list. The row lock is held from load to commit and dropped on return.
    fn mutate<F>(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
        build: F,
    ) -> Result<Mutation, ConversationError>
    where
        F: FnOnce(&ConversationRecord, &ConversationKeys) -> Result<Vec<Token>, ConversationError>,
    {
        let keys = derive_keys(ctx, conversation_id)?;

        let _row = self.storage.lock_conversation(conversation_id)?;
        tracing::trace!(conversation_id, "Acquired row lock");

        let current = self.load_owned(ctx, conversation_id)?;
        let current_root = check_root(&current, &keys, conversation_id)?;

        let tokens = build(&current, &keys)?;

        // Pure appends extend the verified chain; truncations replay it
        let root = if tokens.starts_with(&current.tokens) {
            let mut builder = ChainBuilder::resume(keys.integrity(), current_root, current.count);
            for token in &tokens[current.tokens.len()..] {
                builder.push(token);
            }
            builder.root()
        } else {
            compute_root(&tokens, keys.integrity())
        };
        let record = current.successor(tokens, root.to_hex());

        let committed = self.storage.commit_conversation(conversation_id, current.version, &record);
        if let Err(e) = committed {
            if e.is_transient() {
                tracing::warn!(
                    conversation_id,
                    version = current.version,
                    error = %e,
                    "Commit failed, record unchanged, retry may succeed"
                );
            } else {
                tracing::error!(
                    conversation_id,
                    version = current.version,
                    error = %e,
                    "Commit failed, record unchanged"
                );
            }
            return Err(e.into());
        }

        Ok(Mutation { record, previous_count: current.count })
    }

    /// Load a live record owned by the caller.
    ///
    /// Missing, discarded and foreign conversations are indistinguishable.
    fn load_owned(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
    ) -> Result<ConversationRecord, ConversationError> {
        match self.storage.load_conversation(conversation_id)? {
            Some(record) if record.owner == ctx.user_id() && !record.deleted => Ok(record),
            Some(_) | None => Err(ConversationError::not_found(conversation_id)),
        }
    }

    fn pack(
        &self,
        keys: &ConversationKeys,
        conversation_id: &str,
        message: &Message,
    ) -> Result<Token, ConversationError> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.env.random_bytes(&mut nonce);

        let packed = pack_with_level(
            message,
            keys.encryption(),
            conversation_id,
            nonce,
            self.config.compression_level,
        )
        .map_err(|e| {
            ConversationError::validation(format!(
                "message {} cannot be packed: {e}",
                message.sequence
            ))
        })?;

        tracing::debug!(
            conversation_id,
            sequence = message.sequence,
            raw_bytes = packed.stats.raw_bytes,
            compressed_bytes = packed.stats.compressed_bytes,
            encrypted_bytes = packed.stats.encrypted_bytes,
            compression_ratio = packed.stats.compression_ratio(),
            "Packed message"
        );

        Ok(packed.token)
    }

    fn check_batch(&self, len: usize) -> Result<(), ConversationError> {
        if len == 0 {
            return Err(ConversationError::validation("append batch is empty"));
        }
        if len > self.config.max_append_batch {
            return Err(ConversationError::validation(format!(
                "append batch of {len} exceeds limit of {}",
                self.config.max_append_batch
            )));
        }
        Ok(())
    }

    fn check_content(&self, content: &str) -> Result<(), ConversationError> {
        if content.len() > self.config.max_content_bytes {
            return Err(ConversationError::validation(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                self.config.max_content_bytes
            )));
        }
        Ok(())
    }

    fn record_usage(
        &self,
        ctx: &RequestContext,
        conversation_id: &str,
        kind: UsageKind,
        added: u64,
        mutation: &Mutation,
    ) {
        self.notifier.record_usage(UsageEvent {
            owner: ctx.user_id().to_string(),
            conversation_id: conversation_id.to_string(),
            kind,
            tokens_added: added,
            tokens_removed: mutation.previous_count + added - mutation.record.count,
            encrypted_bytes: mutation.record.encrypted_bytes(),
        });
    }
}

fn derive_keys(
    ctx: &RequestContext,
    conversation_id: &str,
) -> Result<ConversationKeys, ConversationError> {
    Ok(ConversationKeys::derive(ctx.master_secret(), conversation_id)?)
}

fn decode(
    token: &Token,
    index: usize,
    keys: &ConversationKeys,
    conversation_id: &str,
) -> Result<Message, ConversationError> {
    unpack(token, keys.encryption(), conversation_id).map_err(|source| {
        ConversationError::Decryption { index, sequence: peek_sequence(token).ok(), source }
    })
}

/// As [`decode`], for tokens supplied by the caller.
///
/// Tokens that do not parse are bad input, not tampering.
fn decode_submitted(
    token: &Token,
    index: usize,
    keys: &ConversationKeys,
    conversation_id: &str,
) -> Result<Message, ConversationError> {
    match decode(token, index, keys, conversation_id) {
        Err(ConversationError::Decryption { index, sequence, source })
            if !source.is_tampering() =>
        {
            Err(ConversationError::validation(format!(
                "token {index} (sequence {sequence:?}) is malformed: {source}"
            )))
        },
        result => result,
    }
}

/// Find the token whose decoded sequence is `sequence`.
fn locate(
    record: &ConversationRecord,
    keys: &ConversationKeys,
    conversation_id: &str,
    sequence: u64,
) -> Result<(usize, Message), ConversationError> {
    for (index, token) in record.tokens.iter().enumerate() {
        let message = decode(token, index, keys, conversation_id)?;
        if message.sequence == sequence {
            return Ok((index, message));
        }
    }

    Err(ConversationError::NotFound(format!(
        "message {sequence} in conversation {conversation_id}"
    )))
}

fn stored_root(record: &ConversationRecord) -> Result<ChainRoot, ConversationError> {
    ChainRoot::from_hex(&record.root)
        .map_err(|e| ConversationError::Integrity(format!("stored root is unreadable: {e}")))
}

/// Refuse to build on a record whose root does not match its tokens.
fn check_root(
    record: &ConversationRecord,
    keys: &ConversationKeys,
    conversation_id: &str,
) -> Result<ChainRoot, ConversationError> {
    if record.count != record.tokens.len() as u64 {
        return Err(ConversationError::Integrity(format!(
            "count {} does not match {} stored tokens",
            record.count,
            record.tokens.len()
        )));
    }

    let expected = stored_root(record)?;
    let computed = compute_root(&record.tokens, keys.integrity());

    if computed != expected {
        tracing::error!(
            conversation_id,
            expected = %expected,
            computed = %computed,
            "Stored root does not match tokens"
        );
        return Err(ConversationError::Integrity(format!(
            "stored root {expected} does not match computed root {computed}"
        )));
    }

    Ok(computed)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        auth::{AuthMethod, MIN_SERVER_SECRET_LEN, ServerSecret},
        env::ManualEnv,
        error::ErrorKind,
        storage::MemoryStorage,
    };

    fn ctx(user: &str) -> RequestContext {
        let secret = ServerSecret::from_bytes(vec![42u8; MIN_SERVER_SECRET_LEN]).unwrap();
        let salt = format!("salt-{user}");
        RequestContext::resolve(&secret, user, salt.as_bytes(), AuthMethod::Session).unwrap()
    }

    fn service(notifier: Notifier) -> ConversationService<MemoryStorage, ManualEnv> {
        ConversationService::new(
            MemoryStorage::new(),
            ManualEnv::default(),
            ServiceConfig::default(),
            notifier,
        )
        .unwrap()
    }

    /// Conversation with messages `m1..=mN`, alternating user and assistant.
    fn seeded(
        service: &ConversationService<MemoryStorage, ManualEnv>,
        ctx: &RequestContext,
        n: usize,
    ) -> String {
        let id = service.create_conversation(ctx, Some("conv-1")).unwrap();
        let drafts: Vec<Draft> = (1..=n)
            .map(|i| {
                let role = if i % 2 == 1 { Role::User } else { Role::Assistant };
                Draft::new(role, format!("m{i}"))
            })
            .collect();
        service.append_messages(ctx, &id, &drafts).unwrap();
        id
    }

    fn contents(
        service: &ConversationService<MemoryStorage, ManualEnv>,
        ctx: &RequestContext,
    ) -> Vec<String> {
        service.load_messages(ctx, "conv-1").unwrap().into_iter().map(|m| m.content).collect()
    }

    #[test]
    fn create_starts_empty_with_genesis_root() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");

        let id = service.create_conversation(&alice, None).unwrap();
        let record = service.snapshot(&alice, &id).unwrap();

        assert_eq!(id.len(), 32);
        assert_eq!(record.count, 0);
        assert_eq!(record.version, 0);
        assert!(service.verify(&alice, &id).unwrap().valid);
    }

    #[test]
    fn append_messages_assigns_sequences() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 3);

        let messages = service.load_messages(&alice, "conv-1").unwrap();
        let sequences: Vec<u64> = messages.iter().map(|m| m.sequence).collect();

        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(service.verify(&alice, "conv-1").unwrap().valid);
    }

    #[test]
    fn edit_truncates_and_replaces() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 5);
        let before = service.load_messages(&alice, "conv-1").unwrap();

        service.env.advance_millis(1_000);
        let summary = service.edit(&alice, "conv-1", 3, "m3-edited", false).unwrap();

        assert_eq!(summary.count, 3);
        assert_eq!(contents(&service, &alice), vec!["m1", "m2", "m3-edited"]);

        let after = service.load_messages(&alice, "conv-1").unwrap();
        assert_eq!(after[2].sequence, 3);
        assert_eq!(after[2].role, before[2].role);
        assert!(after[2].timestamp_ms > before[2].timestamp_ms);
        assert_eq!(after[..2], before[..2]);
        assert!(service.verify(&alice, "conv-1").unwrap().valid);
    }

    #[test]
    fn delete_truncates_without_replacement() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 5);

        let summary = service.delete(&alice, "conv-1", 4).unwrap();

        assert_eq!(summary.count, 3);
        assert_eq!(contents(&service, &alice), vec!["m1", "m2", "m3"]);
        assert!(service.verify(&alice, "conv-1").unwrap().valid);
    }

    #[test]
    fn delete_first_message_empties_conversation() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 2);

        let summary = service.delete(&alice, "conv-1", 1).unwrap();

        assert_eq!(summary.count, 0);
        let record = service.snapshot(&alice, "conv-1").unwrap();
        assert!(record.tokens.is_empty());
        assert!(service.verify(&alice, "conv-1").unwrap().valid);
    }

    #[test]
    fn missing_sequence_leaves_record_untouched() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 3);
        let before = service.snapshot(&alice, "conv-1").unwrap();

        let err = service.edit(&alice, "conv-1", 9, "nope", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = service.delete(&alice, "conv-1", 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(service.snapshot(&alice, "conv-1").unwrap(), before);
        assert!(!service.storage().is_locked("conv-1"));
    }

    #[test]
    fn edit_signals_regeneration_only_when_asked() {
        let (tx, mut rx) = mpsc::channel(4);
        let service = service(Notifier::disabled().with_regeneration(tx));
        let alice = ctx("alice");
        seeded(&service, &alice, 4);

        service.edit(&alice, "conv-1", 2, "again", false).unwrap();
        assert!(rx.try_recv().is_err());

        service.append_messages(&alice, "conv-1", &[Draft::new(Role::Assistant, "reply")]).unwrap();
        service.edit(&alice, "conv-1", 2, "once more", true).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            RegenerationRequest {
                owner: "alice".to_string(),
                conversation_id: "conv-1".to_string(),
                from_sequence: 2,
            }
        );

        service.delete(&alice, "conv-1", 1).unwrap();
        assert!(rx.try_recv().is_err(), "delete never requests regeneration");
    }

    #[test]
    fn closed_regeneration_channel_does_not_fail_edit() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let service = service(Notifier::disabled().with_regeneration(tx));
        let alice = ctx("alice");
        seeded(&service, &alice, 2);

        assert!(service.edit(&alice, "conv-1", 2, "x", true).is_ok());
    }

    #[test]
    fn append_checks_sequence_continuity() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 2);

        // Pack a token for sequence 5 while the next expected is 3
        let keys = derive_keys(&alice, "conv-1").unwrap();
        let message = Message::new(Role::User, "skip", 5, 0);
        let token = service.pack(&keys, "conv-1", &message).unwrap();

        let err = service.append(&alice, "conv-1", vec![token]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(service.snapshot(&alice, "conv-1").unwrap().count, 2);

        let message = Message::new(Role::User, "next", 3, 0);
        let token = service.pack(&keys, "conv-1", &message).unwrap();
        assert_eq!(service.append(&alice, "conv-1", vec![token]).unwrap().count, 3);
    }

    #[test]
    fn append_rejects_foreign_tokens() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 1);
        service.create_conversation(&alice, Some("conv-2")).unwrap();

        // Correct next sequence, wrong conversation
        let keys = derive_keys(&alice, "conv-2").unwrap();
        let token = service.pack(&keys, "conv-2", &Message::new(Role::User, "x", 2, 0)).unwrap();

        let err = service.append(&alice, "conv-1", vec![token]).unwrap_err();
        assert!(matches!(err, ConversationError::Decryption { index: 0, sequence: Some(2), .. }));
    }

    #[test]
    fn append_rejects_malformed_tokens_as_invalid_input() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 1);

        let err = service
            .append(&alice, "conv-1", vec![Token::from("not-a-token!!".to_string())])
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("token 0"));
        assert_eq!(service.snapshot(&alice, "conv-1").unwrap().count, 1);
    }

    #[test]
    fn unusable_config_is_rejected_at_construction() {
        let config = ServiceConfig { max_append_batch: 0, ..ServiceConfig::default() };

        let result = ConversationService::new(
            MemoryStorage::new(),
            ManualEnv::default(),
            config,
            Notifier::disabled(),
        );

        assert!(matches!(result, Err(ConfigError::EmptyAppendBatch)));
    }

    #[test]
    fn batch_limits() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 1);

        let err = service.append(&alice, "conv-1", Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let drafts = vec![Draft::new(Role::User, "x"); service.config().max_append_batch + 1];
        let err = service.append_messages(&alice, "conv-1", &drafts).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let huge = "x".repeat(service.config().max_content_bytes + 1);
        let err = service.edit(&alice, "conv-1", 1, &huge, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn other_users_see_not_found() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        let bob = ctx("bob");
        seeded(&service, &alice, 2);

        let not_found = Some(ErrorKind::NotFound);
        assert_eq!(service.load_messages(&bob, "conv-1").err().map(|e| e.kind()), not_found);
        assert_eq!(service.edit(&bob, "conv-1", 1, "x", false).err().map(|e| e.kind()), not_found);
        assert_eq!(service.discard_conversation(&bob, "conv-1").err().map(|e| e.kind()), not_found);
        assert!(service.list_conversations(&bob).unwrap().is_empty());
    }

    #[test]
    fn discard_tombstones_conversation() {
        let (tx, mut rx) = mpsc::channel(16);
        let service = service(Notifier::disabled().with_usage(tx));
        let alice = ctx("alice");
        seeded(&service, &alice, 3);

        service.discard_conversation(&alice, "conv-1").unwrap();

        let not_found = Some(ErrorKind::NotFound);
        assert_eq!(service.load_messages(&alice, "conv-1").err().map(|e| e.kind()), not_found);
        assert_eq!(service.delete(&alice, "conv-1", 1).err().map(|e| e.kind()), not_found);

        let err = service.discard_conversation(&alice, "conv-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(service.list_conversations(&alice).unwrap().is_empty());

        // The id stays reserved
        let err = service.create_conversation(&alice, Some("conv-1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds, vec![UsageKind::Created, UsageKind::Appended, UsageKind::Discarded]);
    }

    #[test]
    fn usage_counts_follow_truncation() {
        let (tx, mut rx) = mpsc::channel(16);
        let service = service(Notifier::disabled().with_usage(tx));
        let alice = ctx("alice");
        seeded(&service, &alice, 5);

        service.edit(&alice, "conv-1", 2, "edited", false).unwrap();

        let edited = std::iter::from_fn(|| rx.try_recv().ok())
            .find(|e| e.kind == UsageKind::Edited)
            .unwrap();
        assert_eq!(edited.tokens_added, 1);
        assert_eq!(edited.tokens_removed, 4);
    }

    #[test]
    fn tampered_record_blocks_mutation() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");
        seeded(&service, &alice, 3);

        // Reorder tokens behind the service's back
        let mut record = service.snapshot(&alice, "conv-1").unwrap();
        record.tokens.swap(0, 1);
        let expected = record.version;
        record.version += 1;
        service.storage().commit_conversation("conv-1", expected, &record).unwrap();

        let err = service.delete(&alice, "conv-1", 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);

        let report = service.verify(&alice, "conv-1").unwrap();
        assert!(!report.valid);
        assert_eq!(report.last_valid_sequence, None);
    }

    #[test]
    fn invalid_conversation_id_is_validation_error() {
        let service = service(Notifier::disabled());
        let alice = ctx("alice");

        let err = service.create_conversation(&alice, Some("has space")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = service.snapshot(&alice, "").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
