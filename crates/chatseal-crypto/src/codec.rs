//! Message tokens: CBOR, optional zstd, `XChaCha20-Poly1305`
//!
//! All functions are pure - the nonce must be provided by the caller.
//!
//! # Token Layout
//!
//! A token is URL-safe base64 (no padding) of:
//!
//! ```text
//! [version: 1][compression: 1][sequence: 8 BE][nonce: 24][ciphertext + tag]
//! ```
//!
//! The first 10 bytes (the header) travel in clear so [`unpack`] can reject
//! malformed tokens before touching the cipher, but they are bound into the
//! associated data together with the conversation context. Moving a token to
//! another position or conversation therefore fails authentication.

use std::{fmt, io::Read};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::CodecError,
    keys::{ConversationKey, validate_context},
};

/// Current token format version
pub const TOKEN_VERSION: u8 = 1;

/// `XChaCha20` nonce size (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Upper bound on a serialized message, before and after decompression
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// zstd level used by [`pack`]
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Poly1305 tag size (16 bytes)
const TAG_SIZE: usize = 16;

/// version + compression marker + sequence
const HEADER_SIZE: usize = 1 + 1 + 8;

/// Prefix of the associated data
const AAD_LABEL: &[u8] = b"chatsealTokenV1";

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Written by the user
    User,
    /// Produced by the generation pipeline
    Assistant,
    /// Instructions injected by the system
    System,
}

impl Role {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical message carried by one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Author
    pub role: Role,
    /// Plaintext content (may be empty)
    pub content: String,
    /// Position in the conversation, starting at
    /// [`SEQUENCE_BASELINE`](crate::SEQUENCE_BASELINE)
    pub sequence: u64,
    /// Unix time in milliseconds
    pub timestamp_ms: u64,
}

impl Message {
    /// Build a message.
    pub fn new(role: Role, content: impl Into<String>, sequence: u64, timestamp_ms: u64) -> Self {
        Self { role, content: content.into(), sequence, timestamp_ms }
    }

    /// SHA-256 of `content`.
    pub fn content_hash(&self) -> [u8; 32] {
        content_hash(&self.content)
    }
}

/// SHA-256 of message content.
pub fn content_hash(content: &str) -> [u8; 32] {
    Sha256::digest(content.as_bytes()).into()
}

/// Opaque encrypted message.
///
/// Tokens are immutable; editing a message discards its token and packs a
/// new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Token {
    fn from(text: String) -> Self {
        Self(text)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compression marker recorded in the token header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Payload stored as-is
    None,
    /// Payload compressed with zstd
    Zstd,
}

impl Compression {
    fn to_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(Self::None),
            1 => Ok(Self::Zstd),
            other => Err(CodecError::format(format!("unknown compression marker {other}"))),
        }
    }
}

/// Size accounting for one [`pack`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackStats {
    /// Serialized payload size
    pub raw_bytes: usize,
    /// Size handed to the cipher (after optional compression)
    pub compressed_bytes: usize,
    /// Size of the binary token before base64
    pub encrypted_bytes: usize,
    /// Whether compression was applied
    pub compression: Compression,
}

impl PackStats {
    /// `compressed_bytes / raw_bytes`; 1.0 for an empty payload.
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_bytes == 0 {
            return 1.0;
        }
        self.compressed_bytes as f64 / self.raw_bytes as f64
    }
}

/// Result of [`pack`].
#[derive(Debug, Clone)]
pub struct PackedToken {
    /// The token
    pub token: Token,
    /// Size metrics for observability
    pub stats: PackStats,
}

/// Wire form of a message inside the ciphertext.
#[derive(Serialize, Deserialize)]
struct MessagePayload {
    role: Role,
    content: String,
    sequence: u64,
    timestamp_ms: u64,
    content_hash: [u8; 32],
}

/// Token bytes split into their parts, before decryption.
struct RawToken {
    header: [u8; HEADER_SIZE],
    compression: Compression,
    sequence: u64,
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl RawToken {
    fn parse(token: &str) -> Result<Self, CodecError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| CodecError::format(format!("invalid base64: {e}")))?;

        if bytes.len() < HEADER_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CodecError::format(format!("token too short: {} bytes", bytes.len())));
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);

        if header[0] != TOKEN_VERSION {
            return Err(CodecError::format(format!("unsupported token version {}", header[0])));
        }

        let compression = Compression::from_byte(header[1])?;

        let mut sequence_bytes = [0u8; 8];
        sequence_bytes.copy_from_slice(&header[2..HEADER_SIZE]);
        let sequence = u64::from_be_bytes(sequence_bytes);

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + NONCE_SIZE]);

        let ciphertext = bytes[HEADER_SIZE + NONCE_SIZE..].to_vec();

        Ok(Self { header, compression, sequence, nonce, ciphertext })
    }
}

/// Pack a message with [`DEFAULT_COMPRESSION_LEVEL`].
///
/// See [`pack_with_level`].
pub fn pack(
    message: &Message,
    key: &ConversationKey,
    context: &str,
    nonce: [u8; NONCE_SIZE],
) -> Result<PackedToken, CodecError> {
    pack_with_level(message, key, context, nonce, DEFAULT_COMPRESSION_LEVEL)
}

/// Serialize, compress and encrypt a message into a token.
///
/// The sealed content hash is taken from `message.content`. Compression is
/// only kept when it shrinks the payload.
///
/// # Security
///
/// - Caller MUST provide a fresh random nonce in production
/// - Associated data binds header and `context`
///
/// # Errors
///
/// - `Key`: `context` is not a valid conversation context
/// - `PayloadTooLarge`: serialized message exceeds [`MAX_PAYLOAD_SIZE`]
pub fn pack_with_level(
    message: &Message,
    key: &ConversationKey,
    context: &str,
    nonce: [u8; NONCE_SIZE],
    compression_level: i32,
) -> Result<PackedToken, CodecError> {
    validate_context(context)?;

    let payload = MessagePayload {
        role: message.role,
        content: message.content.clone(),
        sequence: message.sequence,
        timestamp_ms: message.timestamp_ms,
        content_hash: message.content_hash(),
    };

    let mut raw = Vec::new();
    ciborium::into_writer(&payload, &mut raw)
        .map_err(|e| CodecError::format(format!("payload serialization failed: {e}")))?;

    if raw.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge { size: raw.len(), max: MAX_PAYLOAD_SIZE });
    }

    let raw_bytes = raw.len();
    let compressed = zstd::bulk::compress(&raw, compression_level)
        .map_err(|e| CodecError::format(format!("compression failed: {e}")))?;

    let (compression, body) = if compressed.len() < raw.len() {
        (Compression::Zstd, compressed)
    } else {
        (Compression::None, raw)
    };

    let header = build_header(compression, message.sequence);
    let aad = build_aad(&header, context);

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: &body, aad: &aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail for bounded payloads");
    };

    let mut bytes = Vec::with_capacity(HEADER_SIZE + NONCE_SIZE + ciphertext.len());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&nonce);
    bytes.extend_from_slice(&ciphertext);

    let stats = PackStats {
        raw_bytes,
        compressed_bytes: body.len(),
        encrypted_bytes: bytes.len(),
        compression,
    };

    Ok(PackedToken { token: Token(URL_SAFE_NO_PAD.encode(&bytes)), stats })
}

/// Decrypt, decompress and deserialize a token.
///
/// # Errors
///
/// - `Format`: token or decrypted payload does not parse
/// - `Decryption`: authentication failed (wrong key, wrong context, tamper)
/// - `ContentHashMismatch`: decrypted content disagrees with its hash
/// - `Key`: `context` is not a valid conversation context
pub fn unpack(token: &Token, key: &ConversationKey, context: &str) -> Result<Message, CodecError> {
    validate_context(context)?;

    let raw_token = RawToken::parse(token.as_str())?;
    let aad = build_aad(&raw_token.header, context);

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let body = cipher
        .decrypt(
            XNonce::from_slice(&raw_token.nonce),
            Payload { msg: &raw_token.ciphertext, aad: &aad },
        )
        .map_err(|_| CodecError::Decryption)?;

    let raw = match raw_token.compression {
        Compression::None => body,
        Compression::Zstd => decompress(&body)?,
    };

    let payload: MessagePayload = ciborium::from_reader(raw.as_slice())
        .map_err(|e| CodecError::format(format!("payload does not parse: {e}")))?;

    if payload.sequence != raw_token.sequence {
        return Err(CodecError::format(format!(
            "sequence mismatch: header {}, payload {}",
            raw_token.sequence, payload.sequence
        )));
    }

    if content_hash(&payload.content) != payload.content_hash {
        return Err(CodecError::ContentHashMismatch { sequence: payload.sequence });
    }

    Ok(Message {
        role: payload.role,
        content: payload.content,
        sequence: payload.sequence,
        timestamp_ms: payload.timestamp_ms,
    })
}

/// Sequence number from a token header, without decrypting.
///
/// The header is authenticated only once [`unpack`] succeeds, so use this for
/// diagnostics, never for decisions.
///
/// # Errors
///
/// - `Format`: token does not parse
pub fn peek_sequence(token: &Token) -> Result<u64, CodecError> {
    RawToken::parse(token.as_str()).map(|raw| raw.sequence)
}

/// Build the 10-byte token header.
///
/// Structure:
/// - byte 0: format version
/// - byte 1: compression marker
/// - bytes 2-9: sequence (big-endian)
fn build_header(compression: Compression, sequence: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = TOKEN_VERSION;
    header[1] = compression.to_byte();
    header[2..HEADER_SIZE].copy_from_slice(&sequence.to_be_bytes());
    header
}

/// Inflate a zstd body, refusing output past [`MAX_PAYLOAD_SIZE`].
fn decompress(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let decoder = zstd::stream::read::Decoder::with_buffer(body)
        .map_err(|e| CodecError::format(format!("decompression failed: {e}")))?;

    let mut raw = Vec::new();
    decoder
        .take(MAX_PAYLOAD_SIZE as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| CodecError::format(format!("decompression failed: {e}")))?;

    if raw.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge { size: raw.len(), max: MAX_PAYLOAD_SIZE });
    }
    Ok(raw)
}

/// Associated data: label || header || len(context) || context.
fn build_aad(header: &[u8; HEADER_SIZE], context: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_LABEL.len() + HEADER_SIZE + 2 + context.len());
    aad.extend_from_slice(AAD_LABEL);
    aad.extend_from_slice(header);
    aad.extend_from_slice(&(context.len() as u16).to_be_bytes());
    aad.extend_from_slice(context.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ConversationKeys, derive_master_secret};

    const CONTEXT: &str = "conv-test";

    fn test_key(seed: u8) -> ConversationKey {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_add(seed);
        }
        ConversationKey::from_bytes(bytes)
    }

    fn decode(token: &Token) -> Vec<u8> {
        URL_SAFE_NO_PAD.decode(token.as_str()).unwrap()
    }

    fn encode(bytes: &[u8]) -> Token {
        Token(URL_SAFE_NO_PAD.encode(bytes))
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let key = test_key(0);
        let message = Message::new(Role::User, "Hello, World!", 1, 1_700_000_000_123);

        let packed = pack(&message, &key, CONTEXT, [0xAB; NONCE_SIZE]).unwrap();
        let unpacked = unpack(&packed.token, &key, CONTEXT).unwrap();

        assert_eq!(unpacked, message);
    }

    #[test]
    fn empty_content_roundtrips() {
        let key = test_key(0);
        let message = Message::new(Role::Assistant, "", 7, 0);

        let packed = pack(&message, &key, CONTEXT, [0x00; NONCE_SIZE]).unwrap();
        let unpacked = unpack(&packed.token, &key, CONTEXT).unwrap();

        assert_eq!(unpacked.content, "");
        assert_eq!(unpacked.content_hash(), content_hash(""));
    }

    #[test]
    fn timestamp_roundtrips_exactly() {
        let key = test_key(0);
        let message = Message::new(Role::System, "tick", 1, u64::MAX);

        let packed = pack(&message, &key, CONTEXT, [0x01; NONCE_SIZE]).unwrap();
        assert_eq!(unpack(&packed.token, &key, CONTEXT).unwrap().timestamp_ms, u64::MAX);
    }

    #[test]
    fn repetitive_content_is_compressed() {
        let key = test_key(0);
        let message = Message::new(Role::User, "abc".repeat(2000), 1, 0);

        let packed = pack(&message, &key, CONTEXT, [0x02; NONCE_SIZE]).unwrap();

        assert_eq!(packed.stats.compression, Compression::Zstd);
        assert!(packed.stats.compressed_bytes < packed.stats.raw_bytes);
        assert!(packed.stats.compression_ratio() < 1.0);
        assert_eq!(unpack(&packed.token, &key, CONTEXT).unwrap(), message);
    }

    #[test]
    fn short_content_is_stored_raw() {
        let key = test_key(0);
        let message = Message::new(Role::User, "hi", 1, 0);

        let packed = pack(&message, &key, CONTEXT, [0x03; NONCE_SIZE]).unwrap();

        assert_eq!(packed.stats.compression, Compression::None);
        assert_eq!(packed.stats.compressed_bytes, packed.stats.raw_bytes);
        assert_eq!(
            packed.stats.encrypted_bytes,
            HEADER_SIZE + NONCE_SIZE + packed.stats.compressed_bytes + TAG_SIZE
        );
    }

    #[test]
    fn replaced_content_roundtrips_with_fresh_hash() {
        let key = test_key(0);
        let mut message = Message::new(Role::User, "draft", 1, 0);
        message.content = "final".to_string();

        let packed = pack(&message, &key, CONTEXT, [0x04; NONCE_SIZE]).unwrap();
        let unpacked = unpack(&packed.token, &key, CONTEXT).unwrap();

        assert_eq!(unpacked, message);
        assert_eq!(unpacked.content_hash(), content_hash("final"));
    }

    #[test]
    fn decompression_is_bounded() {
        let small = zstd::bulk::compress(&[7u8; 4096], 3).unwrap();
        assert_eq!(decompress(&small).unwrap(), vec![7u8; 4096]);

        let bomb = zstd::bulk::compress(&vec![0u8; MAX_PAYLOAD_SIZE + 1], 3).unwrap();
        assert!(matches!(
            decompress(&bomb),
            Err(CodecError::PayloadTooLarge { size, max: MAX_PAYLOAD_SIZE })
                if size == MAX_PAYLOAD_SIZE + 1
        ));

        assert!(matches!(decompress(b"not zstd"), Err(CodecError::Format { .. })));
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let message = Message::new(Role::User, "secret", 1, 0);
        let packed = pack(&message, &test_key(0), CONTEXT, [0x00; NONCE_SIZE]).unwrap();

        let result = unpack(&packed.token, &test_key(1), CONTEXT);
        assert_eq!(result, Err(CodecError::Decryption));
    }

    #[test]
    fn wrong_context_fails_decryption() {
        let key = test_key(0);
        let message = Message::new(Role::User, "secret", 1, 0);
        let packed = pack(&message, &key, "conv-a", [0x00; NONCE_SIZE]).unwrap();

        let result = unpack(&packed.token, &key, "conv-b");
        assert_eq!(result, Err(CodecError::Decryption));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let key = test_key(0);
        let message = Message::new(Role::User, "original message", 1, 0);
        let packed = pack(&message, &key, CONTEXT, [0x00; NONCE_SIZE]).unwrap();

        let mut bytes = decode(&packed.token);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert_eq!(unpack(&encode(&bytes), &key, CONTEXT), Err(CodecError::Decryption));
    }

    #[test]
    fn rewritten_sequence_fails_decryption() {
        let key = test_key(0);
        let message = Message::new(Role::User, "position 3", 3, 0);
        let packed = pack(&message, &key, CONTEXT, [0x00; NONCE_SIZE]).unwrap();

        // Claim the token belongs at position 4
        let mut bytes = decode(&packed.token);
        bytes[2..HEADER_SIZE].copy_from_slice(&4u64.to_be_bytes());

        assert_eq!(unpack(&encode(&bytes), &key, CONTEXT), Err(CodecError::Decryption));
    }

    #[test]
    fn format_errors_are_detected_before_decryption() {
        let key = test_key(0);

        let not_base64 = Token::from("!!not base64!!".to_string());
        assert!(matches!(unpack(&not_base64, &key, CONTEXT), Err(CodecError::Format { .. })));

        let too_short = encode(&[TOKEN_VERSION, 0, 0]);
        assert!(matches!(unpack(&too_short, &key, CONTEXT), Err(CodecError::Format { .. })));

        let message = Message::new(Role::User, "x", 1, 0);
        let packed = pack(&message, &key, CONTEXT, [0x00; NONCE_SIZE]).unwrap();

        let mut bad_version = decode(&packed.token);
        bad_version[0] = 9;
        assert!(matches!(
            unpack(&encode(&bad_version), &key, CONTEXT),
            Err(CodecError::Format { reason }) if reason.contains("version")
        ));

        let mut bad_marker = decode(&packed.token);
        bad_marker[1] = 7;
        assert!(matches!(
            unpack(&encode(&bad_marker), &key, CONTEXT),
            Err(CodecError::Format { reason }) if reason.contains("compression")
        ));
    }

    #[test]
    fn undecodable_payload_is_format_error() {
        let key = test_key(0);
        let nonce = [0x05; NONCE_SIZE];

        // Authentic ciphertext over bytes that are not a CBOR message
        let header = build_header(Compression::None, 1);
        let aad = build_aad(&header, CONTEXT);
        let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: b"\xff\xff\xff", aad: &aad })
            .unwrap();

        let mut bytes = header.to_vec();
        bytes.extend_from_slice(&nonce);
        bytes.extend_from_slice(&ciphertext);

        assert!(matches!(unpack(&encode(&bytes), &key, CONTEXT), Err(CodecError::Format { .. })));
    }

    #[test]
    fn invalid_context_is_rejected() {
        let key = test_key(0);
        let message = Message::new(Role::User, "x", 1, 0);

        let result = pack(&message, &key, "bad context", [0x00; NONCE_SIZE]);
        assert!(matches!(result, Err(CodecError::Key(_))));
    }

    #[test]
    fn peek_reads_header_sequence() {
        let key = test_key(0);
        let message = Message::new(Role::User, "x", 42, 0);
        let packed = pack(&message, &key, CONTEXT, [0x00; NONCE_SIZE]).unwrap();

        assert_eq!(peek_sequence(&packed.token).unwrap(), 42);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let key = test_key(0);
        let message = Message::new(Role::User, "a".repeat(MAX_PAYLOAD_SIZE + 1), 1, 0);

        let result = pack(&message, &key, CONTEXT, [0x00; NONCE_SIZE]);
        assert!(matches!(result, Err(CodecError::PayloadTooLarge { .. })));
    }

    #[test]
    fn derived_keys_roundtrip() {
        let master = derive_master_secret(b"server_secret_material_for_tests", b"salt").unwrap();
        let keys = ConversationKeys::derive(&master, CONTEXT).unwrap();
        let message = Message::new(Role::User, "through the hierarchy", 1, 5);

        let packed = pack(&message, keys.encryption(), CONTEXT, [0x09; NONCE_SIZE]).unwrap();
        assert_eq!(unpack(&packed.token, keys.encryption(), CONTEXT).unwrap(), message);
    }
}
