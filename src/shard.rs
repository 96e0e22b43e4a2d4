/// Shard Model Module
///
/// Shard sizing policy and the incremental hashing state carried while a
/// shard is drained from the demuxer into its temp file.
use sha2::{Digest, Sha256};

use crate::audit::{AuditGenerator, AuditTree};
use crate::crypto;

/// Smallest shard the network accepts
pub const MIN_SHARD_SIZE: u64 = 2 * 1024 * 1024;

/// Pick the shard size for a file: the smallest power of two >= 2 MiB such
/// that the file splits into at most `max_shards` shards.
pub fn determine_shard_size(file_size: u64, max_shards: u64) -> u64 {
    let max_shards = max_shards.max(1);
    let mut shard_size = MIN_SHARD_SIZE;
    while (file_size + shard_size - 1) / shard_size > max_shards {
        shard_size *= 2;
    }
    shard_size
}

/// Number of shards a file of `file_size` occupies at `shard_size`.
pub fn shard_count(file_size: u64, shard_size: u64) -> u64 {
    (file_size + shard_size - 1) / shard_size
}

/// Hashing state accumulated while a single shard's bytes stream past.
///
/// Feeds both the shard content digest and the audit tree; consumed into a
/// [`FinalizedShard`] when the shard stream ends.
pub struct ShardHasher {
    index: u64,
    size: u64,
    content: Sha256,
    audit: AuditGenerator,
}

/// Digests for a fully drained shard.
pub struct FinalizedShard {
    pub index: u64,
    pub size: u64,
    /// Hex `RIPEMD160(SHA256(bytes))`
    pub hash: String,
    pub tree: AuditTree,
}

impl ShardHasher {
    pub fn new(index: u64, challenges: usize) -> Self {
        Self {
            index,
            size: 0,
            content: Sha256::new(),
            audit: AuditGenerator::new(challenges),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.size += chunk.len() as u64;
        self.content.update(chunk);
        self.audit.update(chunk);
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finalize(self) -> FinalizedShard {
        let digest: [u8; 32] = self.content.finalize().into();
        FinalizedShard {
            index: self.index,
            size: self.size,
            hash: hex::encode(crypto::rmd160(&digest)),
            tree: self.audit.finish(),
        }
    }
}
