use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MeshError, MeshResult};

/// Environment variable that supplies the default bridge URI
pub const BRIDGE_ENV_VAR: &str = "STORJ_BRIDGE";
/// Default bridge URI when neither an explicit URI nor the env var is set
pub const DEFAULT_BRIDGE_URL: &str = "https://api.storj.io";

/// Client configuration for the shardmesh core.
///
/// The environment is consulted exactly once, when options are constructed;
/// every later read goes through the stored value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Bridge base URI
    pub bridge_url: String,
    /// Transfer configuration
    pub transfer: TransferConfig,
    /// Peer protocol configuration
    pub protocol: ProtocolConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Concurrent shard transfers per upload or download
    pub concurrency: usize,
    /// Data-channel attempts per farmer before reassignment
    pub transfer_retries: u32,
    /// Retry budget for adding a shard to a staging frame
    pub add_shard_retries: u32,
    /// Total bridge request timeout in seconds
    pub request_timeout_secs: u64,
    /// Data-channel idle timeout in seconds
    pub channel_idle_timeout_secs: u64,
    /// Upper bound on shards per file, drives the shard-size staircase
    pub max_shards_per_file: u64,
    /// Fixed shard size override; unset means the staircase decides
    pub shard_size: Option<u64>,
    /// Audit challenges generated per shard
    pub audit_challenges: usize,
    /// Directory for in-flight shard temp files
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum accepted age of a peer-message nonce in milliseconds
    pub nonce_tolerance_ms: i64,
    /// Recovered-pubkey cache capacity
    pub pubkey_cache_size: usize,
    /// Inbound peer messages allowed per minute per nodeID
    pub messages_per_minute: u32,
    /// Tunnel server capacity; zero disables the tunnel server
    pub tunnels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Enable structured logging
    pub structured: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            bridge_url: std::env::var(BRIDGE_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_BRIDGE_URL.to_string()),
            transfer: TransferConfig {
                concurrency: 3,
                transfer_retries: 3,
                add_shard_retries: 6,
                request_timeout_secs: 20,
                channel_idle_timeout_secs: 30,
                max_shards_per_file: 1024,
                shard_size: None,
                audit_challenges: 4,
                tmp_dir: std::env::temp_dir(),
            },
            protocol: ProtocolConfig {
                nonce_tolerance_ms: 5_000,
                pubkey_cache_size: 50,
                messages_per_minute: 120,
                tunnels: 0,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                structured: true,
            },
        }
    }
}

impl ClientOptions {
    /// Options pointing at an explicit bridge URI, bypassing the environment.
    pub fn with_bridge_url(url: impl Into<String>) -> Self {
        let mut options = Self::default();
        options.bridge_url = url.into();
        options
    }

    /// Load configuration from file, falling back to defaults
    pub fn load_or_default(config_path: Option<PathBuf>) -> MeshResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let options: ClientOptions = toml::from_str(&config_str)
                    .map_err(|e| MeshError::Config(format!("Config parse error: {}", e)))?;
                tracing::info!("Loaded configuration from {:?}", path);
                return Ok(options);
            }
        }

        tracing::info!("Using default configuration");
        Ok(ClientOptions::default())
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &PathBuf) -> MeshResult<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| MeshError::Config(format!("Config serialize error: {}", e)))?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Bridge request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.request_timeout_secs)
    }

    /// Data-channel idle timeout as Duration
    pub fn channel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.channel_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_transfer_policy() {
        let options = ClientOptions::with_bridge_url("http://localhost:6382");
        assert_eq!(options.transfer.concurrency, 3);
        assert_eq!(options.transfer.transfer_retries, 3);
        assert_eq!(options.transfer.add_shard_retries, 6);
        assert_eq!(options.request_timeout(), Duration::from_secs(20));
        assert_eq!(options.channel_idle_timeout(), Duration::from_secs(30));
        assert_eq!(options.protocol.nonce_tolerance_ms, 5_000);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let mut options = ClientOptions::with_bridge_url("http://bridge.test");
        options.transfer.concurrency = 5;
        options.save(&path).unwrap();

        let loaded = ClientOptions::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.bridge_url, "http://bridge.test");
        assert_eq!(loaded.transfer.concurrency, 5);
    }
}
