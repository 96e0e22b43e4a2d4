/// Key Material Module
///
/// This module handles the client's identity key material: a secp256k1
/// keypair with the address and node identifier derivations used across the
/// network, plus the two signature forms the client produces:
/// - DER-encoded ECDSA for authenticated bridge requests
/// - compact recoverable ECDSA for peer-message envelopes
///
/// Keys are immutable once constructed and live for the process. They can be
/// generated from OS randomness or imported from a WIF-encoded scalar.
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

use crate::crypto;
use crate::error::{MeshError, MeshResult};

/// WIF version prefix for exported private scalars
const WIF_VERSION: u8 = 0x80;
/// Address version prefix (base58check of the 160-bit pubkey digest)
const ADDRESS_VERSION: u8 = 0x00;

/// A secp256k1 keypair with network identity derivations.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
    secp: Secp256k1<All>,
}

impl KeyPair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::rngs::OsRng);
        let public = PublicKey::from_secret_key(&secp, &secret);
        Self {
            secret,
            public,
            secp,
        }
    }

    /// Import a keypair from a WIF-encoded private scalar.
    ///
    /// Accepts both the bare 32-byte payload and the 33-byte form carrying
    /// the compressed-pubkey flag.
    pub fn from_wif(wif: &str) -> MeshResult<Self> {
        let (version, payload) = crypto::base58check_decode(wif)?;
        if version != WIF_VERSION {
            return Err(MeshError::Crypto(format!(
                "Unexpected WIF version byte: 0x{:02x}",
                version
            )));
        }
        let scalar = match payload.len() {
            32 => &payload[..],
            33 if payload[32] == 0x01 => &payload[..32],
            n => {
                return Err(MeshError::Crypto(format!(
                    "WIF payload must be 32 or 33 bytes, got {}",
                    n
                )))
            }
        };
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(scalar)?;
        let public = PublicKey::from_secret_key(&secp, &secret);
        Ok(Self {
            secret,
            public,
            secp,
        })
    }

    /// Export the private scalar as WIF (compressed-pubkey form).
    pub fn to_wif(&self) -> String {
        let mut payload = self.secret.secret_bytes().to_vec();
        payload.push(0x01);
        crypto::base58check_encode(WIF_VERSION, &payload)
    }

    /// Hex of the 33-byte compressed public point, as sent in `x-pubkey`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// The 160-bit node identifier: hex `RIPEMD160(SHA256(pubkey))`.
    pub fn node_id(&self) -> String {
        crypto::rmd160_sha256_hex(&self.public.serialize())
    }

    /// Base58check address derived from the node identifier digest.
    pub fn address(&self) -> String {
        crypto::base58check_encode(ADDRESS_VERSION, &crypto::rmd160_sha256(&self.public.serialize()))
    }

    /// Sign a message for the bridge: hex DER ECDSA over `SHA256(msg)`.
    pub fn sign(&self, msg: &[u8]) -> String {
        let digest = Message::from_digest(crypto::sha256(msg));
        let signature = self.secp.sign_ecdsa(&digest, &self.secret);
        hex::encode(signature.serialize_der())
    }

    /// Sign a peer message: hex 65-byte compact recoverable signature
    /// (`[recovery_id, r, s]`) over `SHA256(msg)`.
    pub fn sign_recoverable(&self, msg: &[u8]) -> String {
        let digest = Message::from_digest(crypto::sha256(msg));
        let signature = self.secp.sign_ecdsa_recoverable(&digest, &self.secret);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = Vec::with_capacity(65);
        bytes.push(recovery_id.to_i32() as u8);
        bytes.extend_from_slice(&compact);
        hex::encode(bytes)
    }
}

/// Verify a hex DER signature over `SHA256(msg)` against a compressed pubkey.
pub fn verify(msg: &[u8], signature_hex: &str, public_key_hex: &str) -> MeshResult<()> {
    let secp = Secp256k1::verification_only();
    let digest = Message::from_digest(crypto::sha256(msg));
    let signature = Signature::from_der(&hex::decode(signature_hex)?)?;
    let public = PublicKey::from_slice(&hex::decode(public_key_hex)?)?;
    secp.verify_ecdsa(&digest, &signature, &public)
        .map_err(MeshError::from)
}

/// Recover the signing pubkey from a hex 65-byte recoverable signature.
pub fn recover(msg: &[u8], signature_hex: &str) -> MeshResult<PublicKey> {
    let bytes = hex::decode(signature_hex)?;
    if bytes.len() != 65 {
        return Err(MeshError::Crypto(format!(
            "Recoverable signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let recovery_id = RecoveryId::from_i32(bytes[0] as i32)?;
    let signature = RecoverableSignature::from_compact(&bytes[1..], recovery_id)?;
    let digest = Message::from_digest(crypto::sha256(msg));
    let secp = Secp256k1::new();
    secp.recover_ecdsa(&digest, &signature)
        .map_err(MeshError::from)
}

/// Convert a recoverable signature into its standard 64-byte form.
pub fn to_standard(signature_hex: &str) -> MeshResult<Signature> {
    let bytes = hex::decode(signature_hex)?;
    if bytes.len() != 65 {
        return Err(MeshError::Crypto(format!(
            "Recoverable signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    let recovery_id = RecoveryId::from_i32(bytes[0] as i32)?;
    let signature = RecoverableSignature::from_compact(&bytes[1..], recovery_id)?;
    Ok(signature.to_standard())
}
