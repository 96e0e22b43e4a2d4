// ===================================================================================================
// Error Handling - Crate-Wide Error Types
// ===================================================================================================
//
// This module defines the error types for the shardmesh client core. Every
// fallible operation in the crate resolves to a `MeshError`, so callers of the
// high-level operations (store, stream, peer dispatch) observe exactly one
// error value per call regardless of how many retries happened underneath.
//
// The variants map onto the failure domains of the system:
//
// - Network:  transport-level failure reaching the bridge or a peer. Retried
//             where the call site carries a retry budget (add-shard, peer RPC).
// - Bridge:   a normalized bridge response with its HTTP status. Retried only
//             for 502/503/504.
// - Protocol: peer-message rejection (version, nonce, signature). Never
//             retried; the message is dropped.
// - Transfer: data-channel failure. Drives the per-shard retry/reassign state
//             machine in the upload orchestrator.
// - Fatal:    impossible-to-complete conditions (all farmers excluded, frame
//             creation failure). Cancels the whole operation.
//
// The remaining variants cover the ambient concerns (I/O, crypto, config,
// serialization, demuxing) that feed into the above at the orchestrator level.
//
// ===================================================================================================

use std::error::Error as StdError;
use std::fmt;

/// Error type for all shardmesh client operations.
///
/// Callers receive a single `MeshError` per high-level call; intermediate
/// retries are not observable. Use [`MeshError::is_transient`] to apply the
/// crate's retry policy at call sites that own a retry budget.
#[derive(Debug, Clone)]
pub enum MeshError {
    /// Transport-level failure contacting the bridge or a peer.
    Network(String),

    /// Normalized bridge error response (HTTP status >= 400).
    Bridge { status: u16, message: String },

    /// Peer-message rejection: version mismatch, expired nonce, or a
    /// signature that does not match the claimed contact.
    Protocol(String),

    /// Data-channel failure during a shard transfer.
    Transfer(String),

    /// Condition that makes the operation impossible to complete.
    Fatal(String),

    /// File system I/O failure (shard temp files, source file access).
    Io(String),

    /// Cryptographic operation failure (key parsing, signing, recovery).
    Crypto(String),

    /// Encoding or decoding of a wire or config payload failed.
    Serialization(String),

    /// Invalid or unusable client configuration.
    Config(String),

    /// The demuxer's byte source failed before producing a shard.
    Demux(String),
}

impl MeshError {
    /// Whether the retry policy allows another attempt for this error.
    ///
    /// Network errors and bridge gateway statuses (502, 503, 504) are
    /// transient; everything else is permanent at the call site.
    pub fn is_transient(&self) -> bool {
        match self {
            MeshError::Network(_) => true,
            MeshError::Bridge { status, .. } => matches!(status, 502 | 503 | 504),
            _ => false,
        }
    }
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::Network(e) => write!(f, "Network error: {}", e),
            MeshError::Bridge { status, message } => {
                write!(f, "Bridge error ({}): {}", status, message)
            }
            MeshError::Protocol(e) => write!(f, "{}", e),
            MeshError::Transfer(e) => write!(f, "Transfer error: {}", e),
            MeshError::Fatal(e) => write!(f, "{}", e),
            MeshError::Io(e) => write!(f, "IO error: {}", e),
            MeshError::Crypto(e) => write!(f, "Cryptographic error: {}", e),
            MeshError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MeshError::Config(e) => write!(f, "Configuration error: {}", e),
            MeshError::Demux(e) => write!(f, "Demux error: {}", e),
        }
    }
}

impl StdError for MeshError {}

impl From<std::io::Error> for MeshError {
    fn from(error: std::io::Error) -> Self {
        MeshError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

impl From<hex::FromHexError> for MeshError {
    fn from(error: hex::FromHexError) -> Self {
        MeshError::Serialization(format!("Hex decode error: {}", error))
    }
}

impl From<secp256k1::Error> for MeshError {
    fn from(error: secp256k1::Error) -> Self {
        MeshError::Crypto(error.to_string())
    }
}

impl From<tokio::task::JoinError> for MeshError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_cancelled() {
            MeshError::Fatal("Operation was aborted".to_string())
        } else {
            MeshError::Fatal(format!("Worker task panicked: {}", error))
        }
    }
}

/// Result type alias for shardmesh operations
pub type MeshResult<T> = Result<T, MeshError>;
