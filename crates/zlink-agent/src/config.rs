//! Agent configuration.
//!
//! Loaded from a TOML file, validated, then overlaid with environment
//! variables:
//!
//! - `ZLINK_PEER`: address of the peer to dial
//! - `ZLINK_LISTEN`: address to accept the peer on
//! - `RUST_LOG`: log filter
//!
//! All durations in the file are milliseconds.
//!
//! # Example TOML
//!
//! ```toml
//! [node]
//! # data_dir = "/var/lib/zlink"
//!
//! [peer]
//! identity = "ed25519:..."
//! address = "10.0.0.7:7420"   # or: listen = "0.0.0.0:7420"
//!
//! [connection]
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//! backoff_factor = 2.0
//! max_attempts = 10
//!
//! [security]
//! admins = ["ed25519:..."]
//!
//! [transfer]
//! auto_accept = false
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use zlink_core::transfer::CheckpointPolicy;
use zlink_core::{ConnectionConfig, GatewayConfig, NodeConfig, TransferConfig};
use zlink_security::identity::parse_identity;
use zlink_security::{AuthConfig, PermissionLevel};
use zlink_transport::{ReconnectionPolicy, MAX_FRAME_SIZE};

const QUALIFIER: &str = "io";
const ORGANIZATION: &str = "zippylink";
const APPLICATION: &str = "zlink";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node: NodeSection,
    pub peer: PeerSection,
    pub connection: ConnectionSection,
    pub security: SecuritySection,
    pub transfer: TransferSection,
    pub logging: LoggingSection,
}

/// Local state locations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Base directory for the identity, database and downloads
    pub data_dir: Option<PathBuf>,
    pub identity_file: Option<PathBuf>,
    pub database: Option<PathBuf>,
}

/// The single paired peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    /// `ed25519:<hex>` identity of the peer
    pub identity: Option<String>,
    /// Dial this `host:port`
    pub address: Option<String>,
    /// Or accept the peer on this `host:port`
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub auto_reconnect: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            max_attempts: 10,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            rpc_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub freshness_window_ms: u64,
    pub nonce_capacity: usize,
    /// Level granted on first contact: "public", "authenticated", "admin" or "system"
    pub first_contact_level: String,
    /// Identities preauthorized at Admin level
    pub admins: Vec<String>,
    /// Identities exempt from the global rate limit
    pub trusted: Vec<String>,
    pub audit_capacity: usize,
    pub audit_flush_interval_ms: u64,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            freshness_window_ms: 300_000,
            nonce_capacity: 10_000,
            first_contact_level: "authenticated".to_string(),
            admins: Vec::new(),
            trusted: Vec::new(),
            audit_capacity: 1_000,
            audit_flush_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub chunk_size: u32,
    pub max_chunk_retries: u32,
    pub max_file_size: u64,
    pub auto_accept: bool,
    pub download_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub min_save_interval_ms: u64,
    pub checkpoint_chunks: u32,
    pub checkpoint_bytes: u64,
    pub batch_flush_interval_ms: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        let defaults = TransferConfig::default();
        let checkpoint = CheckpointPolicy::default();
        Self {
            chunk_size: defaults.chunk_size,
            max_chunk_retries: defaults.max_chunk_retries,
            max_file_size: defaults.max_file_size,
            auto_accept: defaults.auto_accept,
            download_dir: None,
            temp_dir: None,
            min_save_interval_ms: checkpoint.min_save_interval.as_millis() as u64,
            checkpoint_chunks: checkpoint.checkpoint_chunks,
            checkpoint_bytes: checkpoint.checkpoint_bytes,
            batch_flush_interval_ms: checkpoint.batch_flush_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// "error", "warn", "info", "debug" or "trace"
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Also write a daily-rolled log file at this path
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AgentConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `custom_path`, else the default file if it exists, else defaults,
    /// then apply environment overrides.
    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match custom_path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path)?,
                _ => Self::default(),
            },
        };
        Ok(config.with_env(|key| std::env::var(key).ok()))
    }

    /// Apply `ZLINK_PEER`, `ZLINK_LISTEN` and `RUST_LOG` from `lookup`.
    /// `ZLINK_LISTEN` wins if both peer variables are set. `RUST_LOG` is a
    /// full filter directive and is not checked against the level list.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(address) = lookup("ZLINK_PEER") {
            debug!(address = %address, "peer address from environment");
            self.peer.address = Some(address);
            self.peer.listen = None;
        }
        if let Some(listen) = lookup("ZLINK_LISTEN") {
            debug!(listen = %listen, "listen address from environment");
            self.peer.listen = Some(listen);
            self.peer.address = None;
        }
        if let Some(filter) = lookup("RUST_LOG") {
            self.logging.level = filter;
        }
        self
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
            .map(|dirs| dirs.config_dir().join("agent.toml"))
    }

    fn project_data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION).map(|dirs| dirs.data_dir().to_path_buf())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Resolved paths
    // ------------------------------------------------------------------------

    pub fn data_dir(&self) -> PathBuf {
        self.node
            .data_dir
            .clone()
            .or_else(Self::project_data_dir)
            .unwrap_or_else(|| PathBuf::from(".zlink"))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.node
            .identity_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("identity.key"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.node
            .database
            .clone()
            .unwrap_or_else(|| self.data_dir().join("zlink.db"))
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        if c.base_delay_ms == 0 {
            return Err(invalid("connection.base_delay_ms must be greater than 0"));
        }
        if c.max_delay_ms < c.base_delay_ms {
            return Err(invalid("connection.max_delay_ms must be at least base_delay_ms"));
        }
        if !c.backoff_factor.is_finite() || c.backoff_factor < 1.0 {
            return Err(invalid("connection.backoff_factor must be at least 1.0"));
        }
        if c.max_attempts == 0 {
            return Err(invalid("connection.max_attempts must be at least 1"));
        }
        if c.heartbeat_interval_ms == 0 || c.heartbeat_timeout_ms <= c.heartbeat_interval_ms {
            return Err(invalid(
                "connection.heartbeat_timeout_ms must exceed a non-zero heartbeat_interval_ms",
            ));
        }
        if c.rpc_timeout_ms == 0 {
            return Err(invalid("connection.rpc_timeout_ms must be greater than 0"));
        }

        if self.peer.address.is_some() && self.peer.listen.is_some() {
            return Err(invalid("peer.address and peer.listen are mutually exclusive"));
        }
        if let Some(identity) = &self.peer.identity {
            check_identity("peer.identity", identity)?;
        }

        let s = &self.security;
        if s.freshness_window_ms == 0 {
            return Err(invalid("security.freshness_window_ms must be greater than 0"));
        }
        if s.nonce_capacity == 0 || s.audit_capacity == 0 {
            return Err(invalid("security capacities must be greater than 0"));
        }
        self.first_contact_level()?;
        for identity in &s.admins {
            check_identity("security.admins", identity)?;
        }
        for identity in &s.trusted {
            check_identity("security.trusted", identity)?;
        }

        let t = &self.transfer;
        // Base64 in a JSON frame grows a chunk by a third; keep headroom.
        let max_chunk = (MAX_FRAME_SIZE / 2) as u32;
        if t.chunk_size == 0 || t.chunk_size > max_chunk {
            return Err(ConfigError::ValidationError(format!(
                "transfer.chunk_size must be between 1 and {}",
                max_chunk
            )));
        }
        if t.max_file_size == 0 {
            return Err(invalid("transfer.max_file_size must be greater than 0"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) && !self.logging.level.contains('=') {
            return Err(ConfigError::ValidationError(format!(
                "invalid log level '{}'. Valid values: {:?}",
                self.logging.level, valid_levels
            )));
        }
        Ok(())
    }

    pub fn first_contact_level(&self) -> Result<PermissionLevel, ConfigError> {
        PermissionLevel::parse(&self.security.first_contact_level).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "invalid security.first_contact_level '{}'",
                self.security.first_contact_level
            ))
        })
    }

    // ------------------------------------------------------------------------
    // Runtime configuration
    // ------------------------------------------------------------------------

    /// Build the node configuration. Call [`AgentConfig::validate`] first.
    pub fn node_config(&self) -> Result<NodeConfig, ConfigError> {
        let c = &self.connection;
        let connection = ConnectionConfig {
            reconnection: ReconnectionPolicy {
                base_delay: ms(c.base_delay_ms),
                max_delay: ms(c.max_delay_ms),
                backoff_factor: c.backoff_factor,
                max_attempts: c.max_attempts,
            },
            auto_reconnect: c.auto_reconnect,
            heartbeat_interval: ms(c.heartbeat_interval_ms),
            heartbeat_timeout: ms(c.heartbeat_timeout_ms),
            ..ConnectionConfig::default()
        };

        let s = &self.security;
        let auth = AuthConfig {
            freshness_window: ms(s.freshness_window_ms),
            nonce_capacity: s.nonce_capacity,
        };
        let gateway = GatewayConfig {
            audit_capacity: s.audit_capacity,
            audit_flush_interval: ms(s.audit_flush_interval_ms),
            first_contact_level: self.first_contact_level()?,
            ..GatewayConfig::default()
        };

        let t = &self.transfer;
        let data_dir = self.data_dir();
        let transfer = TransferConfig {
            chunk_size: t.chunk_size,
            max_chunk_retries: t.max_chunk_retries,
            download_dir: t.download_dir.clone().unwrap_or_else(|| data_dir.join("downloads")),
            temp_dir: t.temp_dir.clone().unwrap_or_else(|| data_dir.join("partial")),
            auto_accept: t.auto_accept,
            max_file_size: t.max_file_size,
            checkpoint: CheckpointPolicy {
                min_save_interval: ms(t.min_save_interval_ms),
                checkpoint_chunks: t.checkpoint_chunks,
                checkpoint_bytes: t.checkpoint_bytes,
                batch_flush_interval: ms(t.batch_flush_interval_ms),
            },
            command_timeout: ms(c.rpc_timeout_ms),
        };

        Ok(NodeConfig {
            connection,
            auth,
            gateway,
            transfer,
            rpc_timeout: ms(c.rpc_timeout_ms),
        })
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

fn check_identity(field: &str, identity: &str) -> Result<(), ConfigError> {
    parse_identity(identity)
        .map(|_| ())
        .map_err(|e| ConfigError::ValidationError(format!("{}: {}", field, e)))
}
