//! Keyed hash chain over an ordered token sequence
//!
//! ```text
//! acc₀ = HMAC(ik, GENESIS_LABEL)
//! accᵢ = HMAC(ik, accᵢ₋₁ ‖ u64_be(i) ‖ tokenᵢ)
//! root = accₙ
//! ```
//!
//! Each step binds the previous accumulator, the token's index and its exact
//! bytes, so any insertion, removal, reordering or bit flip changes every
//! later accumulator. This is a chain, not a Merkle tree: verification replays
//! the whole sequence from genesis.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::{
    codec::{Token, peek_sequence, unpack},
    error::CodecError,
    keys::{ConversationKey, IntegrityKey},
};

type HmacSha256 = Hmac<Sha256>;

/// Sequence number of the first message in every conversation
pub const SEQUENCE_BASELINE: u64 = 1;

/// Label for the genesis accumulator
const GENESIS_LABEL: &[u8] = b"chatsealChainGenesisV1";

/// Chain digest summarizing a whole token sequence.
///
/// Equality is constant time.
#[derive(Clone, Copy)]
pub struct ChainRoot([u8; 32]);

impl ChainRoot {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, the persisted form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the persisted hex form.
    ///
    /// # Errors
    ///
    /// - `Format`: not 64 hex characters
    pub fn from_hex(text: &str) -> Result<Self, CodecError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|e| CodecError::format(format!("invalid chain root {text:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl PartialEq for ChainRoot {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for ChainRoot {}

impl fmt::Debug for ChainRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainRoot({})", self.to_hex())
    }
}

impl fmt::Display for ChainRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental chain accumulator.
///
/// Feeding tokens one at a time yields the same root as [`compute_root`] over
/// the full slice.
pub struct ChainBuilder<'k> {
    key: &'k IntegrityKey,
    acc: [u8; 32],
    next_index: u64,
}

impl<'k> ChainBuilder<'k> {
    /// Start at the genesis accumulator.
    pub fn new(key: &'k IntegrityKey) -> Self {
        let mut mac = keyed_mac(key);
        mac.update(GENESIS_LABEL);
        Self { key, acc: mac.finalize().into_bytes().into(), next_index: 0 }
    }

    /// Continue from a known root covering `len` tokens.
    pub fn resume(key: &'k IntegrityKey, root: ChainRoot, len: u64) -> Self {
        Self { key, acc: root.0, next_index: len }
    }

    /// Fold the next token into the accumulator.
    pub fn push(&mut self, token: &Token) {
        let mut mac = keyed_mac(self.key);
        mac.update(&self.acc);
        mac.update(&self.next_index.to_be_bytes());
        mac.update(token.as_str().as_bytes());

        self.acc = mac.finalize().into_bytes().into();
        self.next_index += 1;
    }

    /// Number of tokens folded so far.
    pub fn len(&self) -> u64 {
        self.next_index
    }

    /// True if no token has been folded.
    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    /// Current accumulator.
    pub fn root(&self) -> ChainRoot {
        ChainRoot(self.acc)
    }
}

fn keyed_mac(key: &IntegrityKey) -> HmacSha256 {
    let Ok(mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac
}

/// Root of the empty sequence.
pub fn genesis_root(key: &IntegrityKey) -> ChainRoot {
    ChainBuilder::new(key).root()
}

/// Fold an ordered token list into its chain root.
pub fn compute_root(tokens: &[Token], key: &IntegrityKey) -> ChainRoot {
    let mut builder = ChainBuilder::new(key);
    for token in tokens {
        builder.push(token);
    }
    builder.root()
}

/// One problem found by [`verify_integrity`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// Recomputed root differs from the expected root
    #[error("chain root mismatch: expected {expected}, computed {computed}")]
    RootMismatch {
        /// Root the caller recorded
        expected: ChainRoot,
        /// Root recomputed from the tokens
        computed: ChainRoot,
    },

    /// A token failed to decrypt or parse
    #[error("token {index} (claimed sequence {claimed_sequence:?}) failed to decode: {source}")]
    Undecodable {
        /// Position in the token list
        index: usize,
        /// Unauthenticated sequence from the token header, if readable
        claimed_sequence: Option<u64>,
        /// Codec failure
        source: CodecError,
    },

    /// Sequence numbers are not gap-free and ascending
    #[error("token {index} has sequence {found}, expected {expected}")]
    SequenceGap {
        /// Position in the token list
        index: usize,
        /// Sequence the position requires
        expected: u64,
        /// Sequence the token carries
        found: u64,
    },
}

impl IntegrityIssue {
    /// Token index the issue refers to, if it refers to one.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::RootMismatch { .. } => None,
            Self::Undecodable { index, .. } | Self::SequenceGap { index, .. } => Some(*index),
        }
    }
}

/// Outcome of [`verify_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Root matches and every token verified
    pub valid: bool,
    /// Problems found, in discovery order
    pub errors: Vec<IntegrityIssue>,
    /// Last sequence verified before the first failure, or the final sequence
    /// when the sequence is intact. `None` if no token verified.
    pub last_valid_sequence: Option<u64>,
    /// Root recomputed from the tokens
    pub computed_root: ChainRoot,
}

/// Verify a token sequence against a recorded root.
///
/// Recomputes the root, then decrypts every token in order and checks that
/// sequences run gap-free from [`SEQUENCE_BASELINE`]. Decoding stops at the
/// first token that fails decryption or continuity.
pub fn verify_integrity(
    tokens: &[Token],
    expected_root: &ChainRoot,
    encryption_key: &ConversationKey,
    integrity_key: &IntegrityKey,
    context: &str,
) -> IntegrityReport {
    let computed_root = compute_root(tokens, integrity_key);
    let mut errors = Vec::new();

    if computed_root != *expected_root {
        errors.push(IntegrityIssue::RootMismatch {
            expected: *expected_root,
            computed: computed_root,
        });
    }

    let mut last_valid_sequence = None;
    for (index, token) in tokens.iter().enumerate() {
        let expected = SEQUENCE_BASELINE + index as u64;

        match unpack(token, encryption_key, context) {
            Ok(message) if message.sequence == expected => {
                last_valid_sequence = Some(message.sequence);
            },
            Ok(message) => {
                let found = message.sequence;
                errors.push(IntegrityIssue::SequenceGap { index, expected, found });
                break;
            },
            Err(source) => {
                errors.push(IntegrityIssue::Undecodable {
                    index,
                    claimed_sequence: peek_sequence(token).ok(),
                    source,
                });
                break;
            },
        }
    }

    IntegrityReport { valid: errors.is_empty(), errors, last_valid_sequence, computed_root }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Message, NONCE_SIZE, Role, pack};

    const CONTEXT: &str = "conv-chain";

    fn keys() -> (ConversationKey, IntegrityKey) {
        (ConversationKey::from_bytes([0x11; 32]), IntegrityKey::from_bytes([0x22; 32]))
    }

    fn tokens(enc: &ConversationKey, count: u64) -> Vec<Token> {
        (SEQUENCE_BASELINE..SEQUENCE_BASELINE + count)
            .map(|seq| {
                let message = Message::new(Role::User, format!("message {seq}"), seq, seq * 1000);
                pack(&message, enc, CONTEXT, [seq as u8; NONCE_SIZE]).unwrap().token
            })
            .collect()
    }

    #[test]
    fn compute_root_is_deterministic() {
        let (enc, int) = keys();
        let tokens = tokens(&enc, 5);

        assert_eq!(compute_root(&tokens, &int), compute_root(&tokens, &int));
    }

    #[test]
    fn empty_sequence_has_genesis_root() {
        let (_, int) = keys();
        assert_eq!(compute_root(&[], &int), genesis_root(&int));
    }

    #[test]
    fn root_depends_on_integrity_key() {
        let (enc, int) = keys();
        let tokens = tokens(&enc, 3);
        let other = IntegrityKey::from_bytes([0x33; 32]);

        assert_ne!(compute_root(&tokens, &int), compute_root(&tokens, &other));
    }

    #[test]
    fn builder_matches_compute_root() {
        let (enc, int) = keys();
        let tokens = tokens(&enc, 4);

        let mut builder = ChainBuilder::new(&int);
        for token in &tokens {
            builder.push(token);
        }

        assert_eq!(builder.len(), 4);
        assert_eq!(builder.root(), compute_root(&tokens, &int));
    }

    #[test]
    fn resume_extends_existing_root() {
        let (enc, int) = keys();
        let tokens = tokens(&enc, 5);

        let prefix_root = compute_root(&tokens[..3], &int);
        let mut builder = ChainBuilder::resume(&int, prefix_root, 3);
        builder.push(&tokens[3]);
        builder.push(&tokens[4]);

        assert_eq!(builder.root(), compute_root(&tokens, &int));
    }

    #[test]
    fn verify_accepts_intact_sequence() {
        let (enc, int) = keys();
        let tokens = tokens(&enc, 5);
        let root = compute_root(&tokens, &int);

        let report = verify_integrity(&tokens, &root, &enc, &int, CONTEXT);

        assert!(report.valid, "{:?}", report.errors);
        assert!(report.errors.is_empty());
        assert_eq!(report.last_valid_sequence, Some(5));
    }

    #[test]
    fn verify_detects_truncation() {
        let (enc, int) = keys();
        let tokens = tokens(&enc, 5);
        let root = compute_root(&tokens, &int);

        let report = verify_integrity(&tokens[..4], &root, &enc, &int, CONTEXT);

        assert!(!report.valid);
        assert!(matches!(report.errors[0], IntegrityIssue::RootMismatch { .. }));
        assert_eq!(report.last_valid_sequence, Some(4));
    }

    #[test]
    fn verify_detects_swap() {
        let (enc, int) = keys();
        let mut tokens = tokens(&enc, 5);
        let root = compute_root(&tokens, &int);

        tokens.swap(1, 3);
        let report = verify_integrity(&tokens, &root, &enc, &int, CONTEXT);

        assert!(!report.valid);
        assert_eq!(report.last_valid_sequence, Some(1));
        assert!(report.errors.contains(&IntegrityIssue::SequenceGap {
            index: 1,
            expected: 2,
            found: 4
        }));
    }

    #[test]
    fn verify_reports_undecodable_token() {
        let (enc, int) = keys();
        let mut tokens = tokens(&enc, 5);
        let root = compute_root(&tokens, &int);

        tokens[2] = Token::from("garbage".to_string());
        let report = verify_integrity(&tokens, &root, &enc, &int, CONTEXT);

        assert!(!report.valid);
        assert_eq!(report.last_valid_sequence, Some(2));
        let issue = report.errors.last().unwrap();
        assert_eq!(issue.index(), Some(2));
        assert!(matches!(
            issue,
            IntegrityIssue::Undecodable { source: CodecError::Format { .. }, .. }
        ));
    }

    #[test]
    fn verify_with_wrong_encryption_key_stops_at_first_token() {
        let (enc, int) = keys();
        let tokens = tokens(&enc, 3);
        let root = compute_root(&tokens, &int);
        let wrong = ConversationKey::from_bytes([0x44; 32]);

        let report = verify_integrity(&tokens, &root, &wrong, &int, CONTEXT);

        // Root still matches: the chain never sees plaintext
        assert!(!report.errors.iter().any(|e| matches!(e, IntegrityIssue::RootMismatch { .. })));
        assert!(!report.valid);
        assert_eq!(report.last_valid_sequence, None);
        assert!(matches!(
            report.errors[0],
            IntegrityIssue::Undecodable {
                index: 0,
                claimed_sequence: Some(1),
                source: CodecError::Decryption
            }
        ));
    }

    #[test]
    fn root_hex_roundtrip() {
        let (_, int) = keys();
        let root = genesis_root(&int);

        let parsed = ChainRoot::from_hex(&root.to_hex()).unwrap();
        assert_eq!(parsed, root);
        assert_eq!(root.to_hex().len(), 64);

        assert!(ChainRoot::from_hex("zz").is_err());
        assert!(ChainRoot::from_hex(&"ab".repeat(31)).is_err());
    }
}
