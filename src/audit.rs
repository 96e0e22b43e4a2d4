/// Audit Tree Module
///
/// Builds the per-shard audit material the bridge stores alongside each
/// contract: a set of random 32-byte challenges and a Merkle tree whose
/// leaves are `RMD160(SHA256(HMAC-SHA256(challenge, shard_bytes)))`. Farmers
/// later answer audits by recomputing a leaf; the bridge checks it against
/// the stored root.
///
/// The leaf list is padded to the next power of two with the hash of the
/// empty string so the tree is always complete.
use hmac::Mac;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{self, HmacSha256};

/// Finished audit material for one shard.
#[derive(Debug, Clone)]
pub struct AuditTree {
    /// Hex challenges, in generation order
    pub challenges: Vec<String>,
    /// Hex Merkle leaves, padded to a power of two
    pub leaves: Vec<String>,
    /// Hex Merkle root
    pub root: String,
    pub depth: u32,
}

/// Incremental audit-leaf state fed chunk by chunk while a shard drains.
pub struct AuditGenerator {
    challenges: Vec<[u8; 32]>,
    macs: Vec<HmacSha256>,
}

impl AuditGenerator {
    /// Draw `count` random 32-byte challenges and prime one HMAC per
    /// challenge.
    pub fn new(count: usize) -> Self {
        let mut challenges = Vec::with_capacity(count);
        let mut macs = Vec::with_capacity(count);
        for _ in 0..count {
            let mut challenge = [0u8; 32];
            OsRng.fill_bytes(&mut challenge);
            macs.push(HmacSha256::new_from_slice(&challenge).expect("HMAC key length"));
            challenges.push(challenge);
        }
        Self { challenges, macs }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        for mac in &mut self.macs {
            mac.update(chunk);
        }
    }

    pub fn finish(self) -> AuditTree {
        let leaves: Vec<[u8; 20]> = self
            .macs
            .into_iter()
            .map(|mac| {
                let digest = mac.finalize().into_bytes();
                crypto::rmd160_sha256(&digest)
            })
            .collect();
        build_tree(&self.challenges, leaves)
    }
}

/// Padding leaf: the 160-bit digest of the empty string.
pub fn empty_leaf() -> [u8; 20] {
    crypto::rmd160_sha256(b"")
}

fn build_tree(challenges: &[[u8; 32]], mut leaves: Vec<[u8; 20]>) -> AuditTree {
    let target = leaves.len().max(1).next_power_of_two();
    leaves.resize(target, empty_leaf());

    let leaf_hex: Vec<String> = leaves.iter().map(hex::encode).collect();
    let mut depth = 0;
    let mut level = leaves;
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let mut joined = Vec::with_capacity(40);
                joined.extend_from_slice(&pair[0]);
                joined.extend_from_slice(&pair[1]);
                crypto::rmd160_sha256(&joined)
            })
            .collect();
        depth += 1;
    }

    AuditTree {
        challenges: challenges.iter().map(hex::encode).collect(),
        leaves: leaf_hex,
        root: hex::encode(level[0]),
        depth,
    }
}
