//! Fuzz target for the mutation protocol under storage failures
//!
//! Drives `ConversationService` over `ChaoticStorage` with arbitrary
//! operation sequences.
//!
//! # Invariants
//!
//! - Mutations NEVER panic on storage errors
//! - A failed mutation leaves the committed record unchanged
//! - The row lock is always released
//! - The surviving conversation always verifies

#![no_main]

use arbitrary::Arbitrary;
use chatseal_crypto::Role;
use chatseal_server::{
    AuthMethod, ChaoticStorage, ConversationService, Draft, ManualEnv, MemoryStorage, Notifier,
    RequestContext, ServerSecret, ServiceConfig, Storage,
};
use libfuzzer_sys::fuzz_target;

const CONVERSATION: &str = "fuzz-mutation";

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    operations: Vec<Operation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    Append { content: String, assistant: bool },
    Edit { sequence: u8, content: String, regenerate: bool },
    Delete { sequence: u8 },
    Load,
    Verify,
}

fuzz_target!(|scenario: Scenario| {
    let failure_rate = f64::from(scenario.failure_rate_tenth % 10) / 10.0;

    let Ok(secret) = ServerSecret::from_bytes(vec![0x42; 32]) else {
        return;
    };
    let Ok(ctx) = RequestContext::resolve(&secret, "fuzzer", b"fuzz-salt", AuthMethod::Session)
    else {
        return;
    };

    let inner = MemoryStorage::new();
    let Ok(clean) = ConversationService::new(
        inner.clone(),
        ManualEnv::default(),
        ServiceConfig::default(),
        Notifier::disabled(),
    ) else {
        return;
    };
    if clean.create_conversation(&ctx, Some(CONVERSATION)).is_err() {
        return;
    }

    let Ok(chaotic) = ConversationService::new(
        ChaoticStorage::with_seed(inner.clone(), failure_rate, scenario.chaos_seed),
        ManualEnv::default(),
        ServiceConfig::default(),
        Notifier::disabled(),
    ) else {
        return;
    };

    for operation in scenario.operations.into_iter().take(64) {
        let Ok(Some(before)) = inner.load_conversation(CONVERSATION) else {
            return;
        };

        let failed = match operation {
            Operation::Append { content, assistant } => {
                let role = if assistant { Role::Assistant } else { Role::User };
                chaotic.append_messages(&ctx, CONVERSATION, &[Draft::new(role, content)]).is_err()
            },
            Operation::Edit { sequence, content, regenerate } => chaotic
                .edit(&ctx, CONVERSATION, u64::from(sequence), &content, regenerate)
                .is_err(),
            Operation::Delete { sequence } => {
                chaotic.delete(&ctx, CONVERSATION, u64::from(sequence)).is_err()
            },
            Operation::Load => {
                let _ = chaotic.load_messages(&ctx, CONVERSATION);
                false
            },
            Operation::Verify => {
                let _ = chaotic.verify(&ctx, CONVERSATION);
                false
            },
        };

        if failed {
            let Ok(Some(after)) = inner.load_conversation(CONVERSATION) else {
                return;
            };
            assert_eq!(after, before, "failed mutation changed the record");
        }
        assert!(!inner.is_locked(CONVERSATION));
    }

    let Ok(report) = clean.verify(&ctx, CONVERSATION) else {
        return;
    };
    assert!(report.valid);
});
