//! Fuzz target for integrity chain tamper detection
//!
//! Builds a valid conversation, applies one arbitrary edit to the token list
//! outside the mutation protocol, and verifies it.
//!
//! # Invariants
//!
//! - `verify_integrity` NEVER panics
//! - Any change to the token list changes the root and fails verification
//! - An untouched list always verifies

#![no_main]

use arbitrary::Arbitrary;
use chatseal_crypto::{
    ConversationKeys, Message, NONCE_SIZE, Role, SEQUENCE_BASELINE, Token, compute_root,
    derive_master_secret, pack, verify_integrity,
};
use libfuzzer_sys::fuzz_target;

const CONTEXT: &str = "fuzz-chain";

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    contents: Vec<String>,
    tamper: Tamper,
}

#[derive(Debug, Clone, Arbitrary)]
enum Tamper {
    None,
    Truncate { keep: u8 },
    Swap { a: u8, b: u8 },
    Remove { index: u8 },
    Duplicate { index: u8 },
    Replace { index: u8, text: String },
}

fuzz_target!(|scenario: Scenario| {
    if scenario.contents.is_empty() || scenario.contents.len() > 32 {
        return;
    }

    let Ok(master) = derive_master_secret(b"fuzz-server-secret", b"fuzz-salt") else {
        return;
    };
    let Ok(keys) = ConversationKeys::derive(&master, CONTEXT) else {
        return;
    };

    let mut tokens = Vec::new();
    for (i, content) in scenario.contents.iter().enumerate() {
        let message = Message::new(Role::User, content.as_str(), SEQUENCE_BASELINE + i as u64, 0);
        let Ok(packed) = pack(&message, keys.encryption(), CONTEXT, [i as u8; NONCE_SIZE]) else {
            return;
        };
        tokens.push(packed.token);
    }

    let root = compute_root(&tokens, keys.integrity());
    let original = tokens.clone();
    let len = tokens.len();

    match scenario.tamper {
        Tamper::None => {},
        Tamper::Truncate { keep } => tokens.truncate(usize::from(keep) % len),
        Tamper::Swap { a, b } => tokens.swap(usize::from(a) % len, usize::from(b) % len),
        Tamper::Remove { index } => {
            tokens.remove(usize::from(index) % len);
        },
        Tamper::Duplicate { index } => {
            let index = usize::from(index) % len;
            tokens.insert(index, tokens[index].clone());
        },
        Tamper::Replace { index, text } => tokens[usize::from(index) % len] = Token::from(text),
    }

    let report = verify_integrity(&tokens, &root, keys.encryption(), keys.integrity(), CONTEXT);

    if tokens == original {
        assert!(report.valid);
    } else {
        assert!(!report.valid);
        assert_ne!(compute_root(&tokens, keys.integrity()), root);
    }
});
