// ===================================================================================================
// shardmesh - Client Core for Decentralized Object Storage
// ===================================================================================================
//
// This library implements the client side of a decentralized object-storage
// network: files are split into fixed-size, content-addressed shards that a
// trusted bridge service places with untrusted storage farmers, and the
// client moves the shard bytes directly over framed peer data channels.
//
// ## KEY DESIGN PRINCIPLES
//
// ### 1. Structured Concurrency
// One task per shard transfer, joined through a bounded worker pool; a
// cancellation token threads through every task so aborting an operation
// kills the queue, closes the channels, and removes temp files.
//
// ### 2. Explicit Seams
// The bridge transport, the data-channel factory, and the routing overlay
// are traits. Production wires HTTP, TCP, and the external DHT library;
// tests wire fakes and observe retry behavior directly.
//
// ### 3. Single Error Per Call
// Retries (add-shard negotiation, per-farmer transfer attempts, slice
// re-resolution) happen inside the orchestrators; callers of a high-level
// operation see exactly one error value.
//
// ### 4. Verified Peers
// Every overlay message is signed with a recoverable ECDSA signature and
// verified against the sender's 160-bit node identifier, behind a nonce
// freshness window and a per-sender rate limit.
//
// ===================================================================================================

// ===== TRANSFER PIPELINES =====
pub mod demux;                    // Fixed-size shard splitter producing shard substreams
pub mod mux;                      // N-way ordered merge of shard streams with a dynamic input queue
pub mod upload;                   // Upload orchestration: frames, contracts, retry/exclude transfers
pub mod download;                 // Download orchestration: tokens, pointer pages, slice re-resolution
pub mod shard;                    // Shard sizing staircase and per-shard hashing state
pub mod audit;                    // Challenge generation and the audit Merkle tree

// ===== BRIDGE AND PEER COMMUNICATION =====
pub mod bridge;                   // Authenticated bridge HTTP client and endpoint surface
pub mod channel;                  // Framed data-channel client for shard push/pull
pub mod overlay;                  // Trait boundary to the external routing overlay
pub mod protocol;                 // Signed peer-message envelopes and inbound dispatch
pub mod rate_limit;               // Per-nodeID inbound message rate limiting
pub mod tunnel;                   // Tunnel discovery over pub/sub announcements

// ===== SECURITY AND KEY MATERIAL =====
pub mod crypto;                   // Hash, HMAC and base58check primitives
pub mod keypair;                  // secp256k1 keypair with address and nodeID derivation

// ===== SYSTEM SUPPORT =====
pub mod config;                   // Client options with TOML support
pub mod error;                    // Core error types and result alias
pub mod logging;                  // Structured logging setup
pub mod models;                   // Wire and data model types
pub mod resilience;               // Bounded retry with exponential backoff

// ===== CONVENIENCE RE-EXPORTS =====

/// Bridge HTTP client
pub use bridge::BridgeClient;

/// Client configuration
pub use config::ClientOptions;

/// Download pipeline front end
pub use download::{DownloadOptions, Downloader};

/// Core error and result types
pub use error::{MeshError, MeshResult};

/// Identity key material
pub use keypair::KeyPair;

/// Upload pipeline front end
pub use upload::{StoreOptions, Uploader};
