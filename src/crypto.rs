/// Crypto Primitives Module
///
/// Hash and MAC primitives shared by the whole client core: SHA-256,
/// RIPEMD-160, the combined 160-bit content digest used for shard hashes and
/// node identifiers, HMAC-SHA256 for audit leaves, and base58check encoding
/// for addresses and WIF key material.
use hmac::{Hmac, Mac};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::{MeshError, MeshResult};

pub type HmacSha256 = Hmac<Sha256>;

/// SHA-256 digest of the input.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hex-encoded SHA-256 digest, as sent in user credential bodies.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// RIPEMD-160 digest of the input.
pub fn rmd160(data: &[u8]) -> [u8; 20] {
    let mut hasher = Ripemd160::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The network's 160-bit content digest: `RIPEMD160(SHA256(data))`.
///
/// Shard hashes, node identifiers and audit tree nodes all use this form.
pub fn rmd160_sha256(data: &[u8]) -> [u8; 20] {
    rmd160(&sha256(data))
}

/// Hex-encoded `RIPEMD160(SHA256(data))`.
pub fn rmd160_sha256_hex(data: &[u8]) -> String {
    hex::encode(rmd160_sha256(data))
}

/// HMAC-SHA256 over `data` keyed with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Base58check-encode `payload` under a one-byte version prefix.
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    bs58::encode(payload).with_check_version(version).into_string()
}

/// Decode a base58check string, returning the version byte and payload.
pub fn base58check_decode(encoded: &str) -> MeshResult<(u8, Vec<u8>)> {
    let decoded = bs58::decode(encoded)
        .with_check(None)
        .into_vec()
        .map_err(|e| MeshError::Serialization(format!("Base58check decode error: {}", e)))?;
    if decoded.is_empty() {
        return Err(MeshError::Serialization(
            "Base58check payload is empty".to_string(),
        ));
    }
    Ok((decoded[0], decoded[1..].to_vec()))
}
