/// Data Model Module
///
/// Serde types for everything the client exchanges with the bridge and with
/// farmers: contacts, shard pointers, staging frames, buckets, file entries,
/// transfer tokens and the shard descriptor sent during contract negotiation.
/// Field names follow the wire protocol (`nodeID`), not Rust convention.
use serde::{Deserialize, Serialize};

/// A peer on the overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub address: String,
    pub port: u16,
    #[serde(rename = "nodeID")]
    pub node_id: String,
    /// Overlay protocol version; absent in farmer stanzas inside pointers
    #[serde(default)]
    pub protocol: String,
}

/// Token operation scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Push,
    Pull,
}

/// A short-lived transfer capability issued per bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    #[serde(default)]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub expires: Option<String>,
}

/// A bridge-issued descriptor for one shard at one farmer.
///
/// Valid for the scope of a single download or upload contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pointer {
    pub index: u64,
    pub size: u64,
    pub hash: String,
    pub token: String,
    pub farmer: Contact,
}

/// A staging frame accumulating shard descriptors at the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub shards: Vec<serde_json::Value>,
}

/// A bucket handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created: Option<String>,
}

/// A file entry inside a bucket, referencing a promoted frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub frame: String,
    pub mimetype: String,
    pub filename: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// A mirror replication request result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mirror {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Bridge response to adding a shard descriptor: the negotiated contract's
/// transfer token and the farmer assigned to hold the shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardAllocation {
    #[serde(default)]
    pub hash: Option<String>,
    pub token: String,
    #[serde(default)]
    pub operation: Option<Operation>,
    pub farmer: Contact,
}

/// Shard descriptor sent to `PUT /frames/:id` during contract negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMeta {
    pub index: u64,
    pub hash: String,
    pub size: u64,
    /// Audit Merkle leaves, hex
    pub tree: Vec<String>,
    /// Audit challenges, hex
    pub challenges: Vec<String>,
    /// nodeIDs of farmers that must not be offered this shard again
    pub exclude: Vec<String>,
}
