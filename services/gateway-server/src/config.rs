//! Gateway-server configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/gateway/server.toml`.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub handshake_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub stale_cleanup_interval: Duration,
    pub storage_sweep_interval: Duration,
    pub max_connections: usize,
    /// Path to the SQLite persistent tier. `None` keeps everything in
    /// memory, which is fine for a single dev instance but loses mapping
    /// state across restarts.
    pub storage_path: Option<String>,
    /// Per-account byte quota backing `get_user_quota`. `None` (the
    /// default) means unlimited.
    pub default_user_byte_limit: Option<u64>,
    /// Per-account concurrent-connection quota backing `get_user_quota`,
    /// used for mappings configured with `max_connections = 0`. `None`
    /// (the default) means unlimited.
    pub default_user_connection_limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    bind: Option<String>,
    handshake_timeout_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    stale_cleanup_interval_secs: Option<u64>,
    storage_sweep_interval_secs: Option<u64>,
    max_connections: Option<usize>,
    storage_path: Option<String>,
    default_user_byte_limit: Option<u64>,
    default_user_connection_limit: Option<u32>,
}

pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/gateway/server.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let bind = raw.bind.unwrap_or_else(|| "0.0.0.0:7000".to_owned());
    let handshake_timeout = Duration::from_secs(raw.handshake_timeout_secs.unwrap_or(10));
    let heartbeat_timeout = Duration::from_secs(raw.heartbeat_timeout_secs.unwrap_or(60));
    let stale_cleanup_interval = Duration::from_secs(raw.stale_cleanup_interval_secs.unwrap_or(15));
    let storage_sweep_interval = Duration::from_secs(raw.storage_sweep_interval_secs.unwrap_or(30));
    let max_connections = raw.max_connections.unwrap_or(10_000);

    if max_connections == 0 {
        return Err(ConfigError::InvalidValue(
            "max_connections must be greater than zero".to_owned(),
        ));
    }

    Ok(ServerConfig {
        bind,
        handshake_timeout,
        heartbeat_timeout,
        stale_cleanup_interval,
        storage_sweep_interval,
        max_connections,
        storage_path: raw.storage_path,
        default_user_byte_limit: raw.default_user_byte_limit,
        default_user_connection_limit: raw.default_user_connection_limit,
    })
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_toml_is_empty() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:7000");
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(60));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let toml_str = r#"
            bind = "127.0.0.1:9100"
            heartbeat_timeout_secs = 30
            max_connections = 500
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9100");
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_connections, 500);
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let err = load_config_from_str("max_connections = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn user_quota_defaults_are_unlimited_when_unset() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.default_user_byte_limit, None);
        assert_eq!(cfg.default_user_connection_limit, None);
    }

    #[test]
    fn user_quota_defaults_parse_when_set() {
        let toml_str = r#"
            default_user_byte_limit = 1000000
            default_user_connection_limit = 20
        "#;
        let cfg = load_config_from_str(toml_str).unwrap();
        assert_eq!(cfg.default_user_byte_limit, Some(1_000_000));
        assert_eq!(cfg.default_user_connection_limit, Some(20));
    }
}
