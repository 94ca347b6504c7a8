//! Fuzz target for token decoding
//!
//! # Strategy
//!
//! - Raw text: arbitrary strings handed straight to the decoder
//! - Encoded bytes: arbitrary bytes wrapped in valid base64, so parsing gets
//!   past the text layer and exercises header, length and AEAD checks
//! - Mutated tokens: a valid token with one byte overwritten
//!
//! # Invariants
//!
//! - `unpack` and `peek_sequence` NEVER panic
//! - Anything that is not a token produced under this key and context is
//!   rejected
//! - A mutated token never decodes

#![no_main]

use arbitrary::Arbitrary;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chatseal_crypto::{
    ConversationKeys, Message, NONCE_SIZE, Role, Token, derive_master_secret, pack, peek_sequence,
    unpack,
};
use libfuzzer_sys::fuzz_target;

const CONTEXT: &str = "fuzz-conv";

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    RawText(String),
    EncodedBytes(Vec<u8>),
    MutatedToken { content: String, position: u16, value: u8 },
}

fuzz_target!(|input: Input| {
    let Ok(master) = derive_master_secret(b"fuzz-server-secret", b"fuzz-salt") else {
        return;
    };
    let Ok(keys) = ConversationKeys::derive(&master, CONTEXT) else {
        return;
    };

    match input {
        Input::RawText(text) => {
            let token = Token::from(text);
            let _ = peek_sequence(&token);
            assert!(unpack(&token, keys.encryption(), CONTEXT).is_err());
        },
        Input::EncodedBytes(bytes) => {
            let token = Token::from(URL_SAFE_NO_PAD.encode(bytes));
            let _ = peek_sequence(&token);
            assert!(unpack(&token, keys.encryption(), CONTEXT).is_err());
        },
        Input::MutatedToken { content, position, value } => {
            let message = Message::new(Role::User, content, 1, 0);
            let Ok(packed) = pack(&message, keys.encryption(), CONTEXT, [0u8; NONCE_SIZE]) else {
                return;
            };

            let Ok(mut bytes) = URL_SAFE_NO_PAD.decode(packed.token.as_str()) else {
                return;
            };
            let position = usize::from(position) % bytes.len();
            if bytes[position] == value {
                return;
            }
            bytes[position] = value;

            let mutated = Token::from(URL_SAFE_NO_PAD.encode(bytes));
            assert!(unpack(&mutated, keys.encryption(), CONTEXT).is_err());
        },
    }
});
