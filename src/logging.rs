/// Logging Module
///
/// Subscriber setup driven by [`LoggingConfig`] plus the targeted event
/// helpers the pipelines log through: bridge traffic, transfer disruptions,
/// peer protocol events, and operation failures. Targets are stable
/// (`shardmesh::bridge`, `shardmesh::transfer`, `shardmesh::peer`,
/// `shardmesh::error`) so embedders can filter per subsystem.
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{MeshError, MeshResult};

/// Filter derived from the configured level; `RUST_LOG` wins when set.
fn configured_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::new(format!("shardmesh={}", config.level))
}

/// Install the global subscriber for applications embedding the client.
pub fn init_logging(config: &LoggingConfig) -> MeshResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| configured_filter(config));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.structured {
        tracing::subscriber::set_global_default(builder.compact().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.map_err(|e| MeshError::Config(format!("Logging setup failed: {}", e)))?;
    info!("shardmesh logging initialized");
    Ok(())
}

/// Install logging, keeping whatever subscriber is already set on failure.
pub fn init_logging_safe(config: &LoggingConfig) {
    if let Err(e) = init_logging(config) {
        eprintln!(
            "Warning: logging setup failed ({}); keeping the existing subscriber",
            e
        );
    }
}

/// Transfer disruptions: shard retries, reassignment, slice re-resolution.
pub fn log_transfer_event(event: &str, shard: u64, details: &str) {
    warn!(target: "shardmesh::transfer", shard, "{}: {}", event, details);
}

/// One line per bridge request.
pub fn log_bridge_request(method: &str, path: &str) {
    debug!(target: "shardmesh::bridge", "{} {}", method, path);
}

/// Peer protocol and tunnel discovery events, keyed by the remote nodeID.
pub fn log_peer_event(event: &str, node_id: &str) {
    info!(target: "shardmesh::peer", "{}: {}", event, node_id);
}

/// Operation failure with its context.
pub fn log_error_with_context(context: &str, error: &MeshError) {
    error!(target: "shardmesh::error", "{}: {}", context, error);
}
