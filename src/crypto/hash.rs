//! Deterministic hashing for the ledger
//!
//! Every hash in the crate is computed over bytes produced here:
//! - RFC 8785 JSON Canonicalization Scheme (JCS) for JSON values
//! - Domain separation prefix for block hashes
//! - Length-prefixed, big-endian framing for string fields
//!
//! # RFC 8785 Compliance
//!
//! Canonicalization is delegated to `serde_json_canonicalizer`:
//! - Keys sorted at every nesting level (UTF-16 code unit order)
//! - Arrays keep their order
//! - ES6 number serialization (`1.0` becomes `1`, `-0` becomes `0`)
//! - No insignificant whitespace, UTF-8 output
//!
//! Strings are hashed exactly as given; no Unicode normalization is applied.

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 hash
pub type Hash256 = [u8; 32];

/// Domain prefix for ledger block hashes
pub const DOMAIN_BLOCK: &[u8] = b"MRO_LEDGER_BLOCK_V1";

// ============================================================================
// Binary Encoding Helpers
// ============================================================================

/// Encode a u32 as 4 bytes big-endian
#[inline]
pub fn u32_be(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Encode a string as length-prefixed UTF-8 bytes
/// Format: U32_BE(len) || UTF8_bytes
pub fn encode_string(s: &str) -> Vec<u8> {
    let utf8_bytes = s.as_bytes();
    let mut result = Vec::with_capacity(4 + utf8_bytes.len());
    result.extend_from_slice(&u32_be(utf8_bytes.len() as u32));
    result.extend_from_slice(utf8_bytes);
    result
}

/// Encode an optional string.
/// Format: 0x00 for `None`, 0x01 || ENC_STR(s) for `Some(s)`
pub fn encode_optional(s: Option<&str>) -> Vec<u8> {
    match s {
        None => vec![0u8],
        Some(s) => {
            let mut result = Vec::with_capacity(5 + s.len());
            result.push(1u8);
            result.extend_from_slice(&encode_string(s));
            result
        }
    }
}

// ============================================================================
// Canonical JSON (RFC 8785 JCS)
// ============================================================================

/// Convert a JSON value to its canonical string representation per RFC 8785.
///
/// # Panics
///
/// Panics if the value contains a float that cannot be represented (NaN or
/// Infinity). `serde_json::Value` cannot hold such numbers, so this only
/// triggers on values built through unchecked `Number` constructors.
pub fn canonicalize_json(value: &serde_json::Value) -> String {
    serde_json_canonicalizer::to_string(value)
        .expect("Failed to canonicalize JSON - contains invalid values (NaN or Infinity)")
}

/// SHA-256 over the canonical JSON bytes of `value`
pub fn canonical_json_hash(value: &serde_json::Value) -> Hash256 {
    sha256(canonicalize_json(value).as_bytes())
}

// ============================================================================
// Block Hash
// ============================================================================

/// Fields bound by a ledger block hash
#[derive(Debug, Clone, Copy)]
pub struct BlockHashParams<'a> {
    pub prev_hash: Option<&'a str>,
    pub event_type: &'a str,
    pub created_at: &'a str, // RFC 3339 string, hashed verbatim
    pub actor_id: Option<i64>,
    pub canonical_payload: &'a str,
}

/// Compute the block hash of one ledger event
///
/// ```text
/// block_preimage =
///   b"MRO_LEDGER_BLOCK_V1" ||
///   ENC_OPT(prev_hash) ||
///   ENC_STR(event_type) ||
///   ENC_STR(created_at) ||
///   ENC_OPT(actor_id as decimal) ||
///   ENC_STR(JCS(payload))
///
/// block_hash = SHA256(block_preimage)
/// ```
pub fn compute_block_hash(params: &BlockHashParams) -> Hash256 {
    let actor = params.actor_id.map(|id| id.to_string());

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_BLOCK);
    hasher.update(encode_optional(params.prev_hash));
    hasher.update(encode_string(params.event_type));
    hasher.update(encode_string(params.created_at));
    hasher.update(encode_optional(actor.as_deref()));
    hasher.update(encode_string(params.canonical_payload));
    hasher.finalize().into()
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Hash raw bytes with SHA-256 (no domain prefix)
pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of raw bytes as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Parse a 32-byte hash from hex (with or without 0x prefix)
pub fn hash_from_hex(hex_str: &str) -> Option<Hash256> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

// ============================================================================
// Tests
// ============================================================================
