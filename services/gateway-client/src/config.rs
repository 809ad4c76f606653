//! Gateway-client configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/gateway/client.toml`.

use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gw_protocol::TransportProtocol;
use gw_transform::TokenBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingProtocol {
    Tcp,
    Udp,
    Socks5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    Aes256Gcm,
    ChaCha20Poly1305,
}

#[derive(Debug, Clone)]
pub struct MappingConfig {
    pub mapping_id: String,
    pub secret_key: String,
    pub protocol: MappingProtocol,
    pub local_port: u16,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    /// Client that should terminate this mapping's tunnels, when it isn't
    /// the client that accepted the local connection (SOCKS-style egress).
    pub target_client_id: Option<String>,
    /// 0 means unlimited.
    pub bandwidth_limit: u64,
    /// 0 means "ask `get_user_quota` instead of enforcing a per-mapping cap".
    pub max_connections: u32,
    pub enable_compression: bool,
    pub compression_level: u8,
    pub enable_encryption: bool,
    pub encryption_method: Option<EncryptionMethod>,
    pub encryption_key: Option<String>,
}

impl MappingConfig {
    /// A fresh limiter for this mapping's configured rate, or `None` if
    /// unlimited. Each direction of a tunnel gets its own bucket, so callers
    /// construct one per direction rather than sharing a single instance.
    pub fn bandwidth_limit_to_bucket(&self) -> Option<Arc<TokenBucket>> {
        if self.bandwidth_limit == 0 {
            None
        } else {
            Some(Arc::new(TokenBucket::new(self.bandwidth_limit)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 0 marks anonymous mode; the server assigns a real id in that case.
    pub client_id: i64,
    pub token: String,
    pub protocol: TransportProtocol,
    pub server_addr: String,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Duration,
    pub command_timeout: Duration,
    pub mappings: Vec<MappingConfig>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    client_id: Option<i64>,
    token: Option<String>,
    protocol: Option<String>,
    server_addr: Option<String>,
    connect_timeout_secs: Option<u64>,
    reconnect_interval_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    #[serde(rename = "mapping")]
    mappings: Option<Vec<RawMappingConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawMappingConfig {
    mapping_id: Option<String>,
    secret_key: Option<String>,
    protocol: Option<String>,
    local_port: Option<u16>,
    target_host: Option<String>,
    target_port: Option<u16>,
    target_client_id: Option<String>,
    bandwidth_limit: Option<u64>,
    max_connections: Option<u32>,
    enable_compression: Option<bool>,
    compression_level: Option<u8>,
    enable_encryption: Option<bool>,
    encryption_method: Option<String>,
    encryption_key: Option<String>,
}

pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/gateway/client.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let client_id = raw.client_id.unwrap_or(0);
    let token = raw.token.unwrap_or_else(|| "anonymous:client".to_owned());
    let protocol = match raw.protocol.as_deref().unwrap_or("tcp") {
        "tcp" => TransportProtocol::Tcp,
        "kcp" => TransportProtocol::Kcp,
        "quic" => TransportProtocol::Quic,
        "ws" => TransportProtocol::Ws,
        other => return Err(ConfigError::InvalidValue(format!("unknown protocol '{other}'"))),
    };
    let server_addr = raw
        .server_addr
        .ok_or_else(|| ConfigError::MissingField("server_addr".to_owned()))?;

    let connect_timeout = Duration::from_secs(raw.connect_timeout_secs.unwrap_or(10));
    let reconnect_interval = Duration::from_secs(raw.reconnect_interval_secs.unwrap_or(5));
    let heartbeat_interval = Duration::from_secs(raw.heartbeat_interval_secs.unwrap_or(20));
    let command_timeout = Duration::from_secs(raw.command_timeout_secs.unwrap_or(5));

    let mut mappings = Vec::new();
    for (i, m) in raw.mappings.unwrap_or_default().into_iter().enumerate() {
        let mapping_id = m
            .mapping_id
            .ok_or_else(|| ConfigError::MissingField(format!("mapping[{i}].mapping_id")))?;
        let secret_key = m
            .secret_key
            .ok_or_else(|| ConfigError::MissingField(format!("mapping[{i}].secret_key")))?;
        let local_port = m
            .local_port
            .ok_or_else(|| ConfigError::MissingField(format!("mapping[{i}].local_port")))?;
        let protocol = match m.protocol.as_deref().unwrap_or("tcp") {
            "tcp" => MappingProtocol::Tcp,
            "udp" => MappingProtocol::Udp,
            "socks5" => MappingProtocol::Socks5,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "mapping[{i}]: unknown protocol '{other}'"
                )))
            }
        };
        let encryption_method = match m.encryption_method.as_deref() {
            None => None,
            Some("aes-256-gcm") => Some(EncryptionMethod::Aes256Gcm),
            Some("chacha20-poly1305") => Some(EncryptionMethod::ChaCha20Poly1305),
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "mapping[{i}]: unknown encryption_method '{other}'"
                )))
            }
        };

        mappings.push(MappingConfig {
            mapping_id,
            secret_key,
            protocol,
            local_port,
            target_host: m.target_host,
            target_port: m.target_port,
            target_client_id: m.target_client_id,
            bandwidth_limit: m.bandwidth_limit.unwrap_or(0),
            max_connections: m.max_connections.unwrap_or(0),
            enable_compression: m.enable_compression.unwrap_or(false),
            compression_level: m.compression_level.unwrap_or(6),
            enable_encryption: m.enable_encryption.unwrap_or(false),
            encryption_method,
            encryption_key: m.encryption_key,
        });
    }

    Ok(ClientConfig {
        client_id,
        token,
        protocol,
        server_addr,
        connect_timeout,
        reconnect_interval,
        heartbeat_interval,
        command_timeout,
        mappings,
    })
}

/// `MappingConfig`'s wire shape for `MappingCreate`/`MappingUpdate`
/// commands pushed by the server at runtime, as opposed to the TOML shape
/// loaded from disk at startup.
#[derive(Debug, Deserialize)]
pub struct MappingCommandBody {
    pub mapping_id: String,
    pub secret_key: String,
    pub protocol: String,
    pub local_port: u16,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub target_client_id: Option<String>,
    pub bandwidth_limit: Option<u64>,
    pub max_connections: Option<u32>,
    pub enable_compression: Option<bool>,
    pub compression_level: Option<u8>,
    pub enable_encryption: Option<bool>,
    pub encryption_method: Option<String>,
    pub encryption_key: Option<String>,
}

impl MappingCommandBody {
    pub fn into_mapping_config(self) -> Result<MappingConfig, ConfigError> {
        let protocol = match self.protocol.as_str() {
            "tcp" => MappingProtocol::Tcp,
            "udp" => MappingProtocol::Udp,
            "socks5" => MappingProtocol::Socks5,
            other => return Err(ConfigError::InvalidValue(format!("unknown protocol '{other}'"))),
        };
        let encryption_method = match self.encryption_method.as_deref() {
            None => None,
            Some("aes-256-gcm") => Some(EncryptionMethod::Aes256Gcm),
            Some("chacha20-poly1305") => Some(EncryptionMethod::ChaCha20Poly1305),
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!("unknown encryption_method '{other}'")))
            }
        };
        Ok(MappingConfig {
            mapping_id: self.mapping_id,
            secret_key: self.secret_key,
            protocol,
            local_port: self.local_port,
            target_host: self.target_host,
            target_port: self.target_port,
            target_client_id: self.target_client_id,
            bandwidth_limit: self.bandwidth_limit.unwrap_or(0),
            max_connections: self.max_connections.unwrap_or(0),
            enable_compression: self.enable_compression.unwrap_or(false),
            compression_level: self.compression_level.unwrap_or(6),
            enable_encryption: self.enable_encryption.unwrap_or(false),
            encryption_method,
            encryption_key: self.encryption_key,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
