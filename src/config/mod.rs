//! Configuration module
//!
//! Handles loading and saving gatehouse configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::{default_cipher, KeySeeds, AUTH_KEY_SEED, WORLD_KEY_SEED};
use crate::network::{
    ConnectionSettings, DEFAULT_COMMAND_QUEUE_SIZE, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_READ_BUFFER_SIZE,
};
use crate::protocol::{ConnectionType, DEFAULT_PORT, MAX_PAYLOAD_LEN};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listener and socket settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Values announced in the greeting
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Packet encryption
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name used in logs for this gateway
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "gatehouse".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of tasks accepting on the listening socket
    #[serde(default = "default_accept_workers")]
    pub accept_workers: usize,
    /// Minimum free space reserved before each socket read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Largest payload a client may declare
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Seconds without inbound bytes before a connection is closed (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Depth of each connection's command queue
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_accept_workers() -> usize {
    4
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_command_queue_size() -> usize {
    DEFAULT_COMMAND_QUEUE_SIZE
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            accept_workers: default_accept_workers(),
            read_buffer_size: default_read_buffer_size(),
            max_packet_size: default_max_packet_size(),
            idle_timeout_secs: 0,
            command_queue_size: default_command_queue_size(),
        }
    }
}

/// Greeting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Service this gateway fronts ("auth" or "world")
    #[serde(default = "default_connection_type")]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub realm_id: u32,
    #[serde(default)]
    pub realm_group_id: u32,
    /// Checksum of the message catalog the client must match
    #[serde(default)]
    pub network_message_crc: u32,
}

fn default_connection_type() -> ConnectionType {
    ConnectionType::Auth
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_type: default_connection_type(),
            realm_id: 0,
            realm_group_id: 0,
            network_message_crc: 0,
        }
    }
}

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encrypt payloads after the greeting
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_auth_seed")]
    pub auth_seed: u64,
    #[serde(default = "default_world_seed")]
    pub world_seed: u64,
}

fn default_true() -> bool {
    true
}

fn default_auth_seed() -> u64 {
    AUTH_KEY_SEED
}

fn default_world_seed() -> u64 {
    WORLD_KEY_SEED
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auth_seed: default_auth_seed(),
            world_seed: default_world_seed(),
        }
    }
}

impl EncryptionConfig {
    pub fn seeds(&self) -> KeySeeds {
        KeySeeds {
            auth: self.auth_seed,
            world: self.world_seed,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("gatehouse/config.toml")),
            Some(PathBuf::from("./gatehouse.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the listener cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        self.bind_addr()?;

        let network = &self.network;
        if network.accept_workers == 0 {
            return Err(invalid("network.accept_workers", "must be at least 1"));
        }
        if network.read_buffer_size == 0 {
            return Err(invalid("network.read_buffer_size", "must be at least 1"));
        }
        if network.command_queue_size == 0 {
            return Err(invalid("network.command_queue_size", "must be at least 1"));
        }
        if network.max_packet_size == 0 || network.max_packet_size > MAX_PAYLOAD_LEN {
            return Err(invalid(
                "network.max_packet_size",
                format!("must be between 1 and {}", MAX_PAYLOAD_LEN),
            ));
        }

        Ok(())
    }

    /// Socket address to listen on
    pub fn bind_addr(&self) -> ConfigResult<SocketAddr> {
        let ip: IpAddr = self.network.bind_address.parse().map_err(|_| {
            invalid(
                "network.bind_address",
                format!("'{}' is not an IP address", self.network.bind_address),
            )
        })?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.network.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Per-connection settings for a listener built from this configuration
    pub fn to_settings(&self) -> ConnectionSettings {
        let connection_type = self.connection.connection_type;
        let mut settings = ConnectionSettings::new(
            connection_type,
            default_cipher(self.encryption.enabled),
            self.encryption.seeds(),
        );

        settings.greeting.realm_id = self.connection.realm_id;
        settings.greeting.realm_group_id = self.connection.realm_group_id;
        settings.greeting.network_message_crc = self.connection.network_message_crc;
        settings.greeting.listen_port = self.network.port;
        settings.max_packet_size = self.network.max_packet_size;
        settings.read_buffer_size = self.network.read_buffer_size;
        settings.idle_timeout = self.idle_timeout();
        settings.command_queue_size = self.network.command_queue_size;
        settings
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "auth-gateway-01".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            idle_timeout_secs: 120,
            ..Default::default()
        },
        connection: ConnectionConfig {
            realm_id: 1,
            realm_group_id: 21,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
