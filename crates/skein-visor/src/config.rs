//! Visor configuration.

use serde::{Deserialize, Serialize};
use skein_crypto::{Keypair, PublicKey, SecretKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Visor configuration file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local identity, public half
    pub pub_key: PublicKey,
    /// Local identity, secret half
    pub sec_key: SecretKey,
    /// Transport layer settings
    pub transport: TransportConfig,
    /// Routing control-plane settings
    pub routing: RoutingConfig,
    /// Enabled underlays
    #[serde(default)]
    pub underlays: UnderlayConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Transport discovery service URL
    pub discovery: String,
    /// Packet-counter store
    #[serde(default)]
    pub log_store: LogStoreConfig,
}

/// Log store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogStoreKind {
    /// Keep counters in memory only
    #[default]
    Memory,
    /// One JSON file per transport under `location`
    File,
}

/// Packet-counter store settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogStoreConfig {
    /// Backend selection
    #[serde(rename = "type", default)]
    pub kind: LogStoreKind,
    /// Directory for the `file` backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
}

/// Routing control-plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Setup nodes trusted to install rules
    #[serde(default)]
    pub setup_nodes: Vec<PublicKey>,
    /// Route finder service URL
    pub route_finder: String,
    /// Route finder request timeout in milliseconds
    #[serde(default = "default_route_finder_timeout_ms")]
    pub route_finder_timeout_ms: u64,
    /// Keep-alive installed on dialed routes, in milliseconds
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
}

fn default_route_finder_timeout_ms() -> u64 {
    10_000
}

fn default_keep_alive_ms() -> u64 {
    120_000
}

/// Enabled underlays. The in-process memory underlay is always on; TCP is
/// enabled by its section being present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnderlayConfig {
    /// TCP underlay with a static PK → address table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpConfig>,
}

/// TCP underlay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Address the visor accepts TCP streams on
    pub listen_addr: SocketAddr,
    /// Known visors reachable over TCP
    #[serde(default)]
    pub pk_table: HashMap<PublicKey, SocketAddr>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. `info` or `skein_router=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Template config with a freshly generated identity.
    #[must_use]
    pub fn generate() -> Self {
        let keys = Keypair::generate();
        Self {
            pub_key: keys.public,
            sec_key: keys.secret,
            transport: TransportConfig {
                discovery: "http://transport.discovery.skein.local".to_string(),
                log_store: LogStoreConfig::default(),
            },
            routing: RoutingConfig {
                setup_nodes: Vec::new(),
                route_finder: "http://routefinder.skein.local".to_string(),
                route_finder_timeout_ms: default_route_finder_timeout_ms(),
                keep_alive_ms: default_keep_alive_ms(),
            },
            underlays: UnderlayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// I/O failures, malformed JSON, or a secret key that does not match
    /// `pub_key`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&raw)?;
        if config.sec_key.public_key() != config.pub_key {
            return Err(ConfigError::KeyMismatch);
        }
        Ok(config)
    }

    /// Write as pretty JSON.
    ///
    /// # Errors
    ///
    /// I/O failures.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// The identity pair this config carries.
    #[must_use]
    pub fn keypair(&self) -> Keypair {
        Keypair {
            public: self.pub_key,
            secret: self.sec_key.clone(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("config file: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// `sec_key` does not derive `pub_key`
    #[error("sec_key does not match pub_key")]
    KeyMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skein.json");

        let config = Config::generate();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.pub_key, config.pub_key);
        assert_eq!(loaded.routing.keep_alive_ms, 120_000);
        assert_eq!(loaded.transport.log_store.kind, LogStoreKind::Memory);
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skein.json");

        let mut config = Config::generate();
        config.pub_key = Keypair::generate().public;
        config.save(&path).unwrap();
        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::KeyMismatch
        ));
    }

    #[test]
    fn test_defaults_fill_in() {
        let keys = Keypair::generate();
        let raw = serde_json::json!({
            "pub_key": keys.public,
            "sec_key": keys.secret,
            "transport": { "discovery": "http://disc" },
            "routing": { "route_finder": "http://rf" },
        });
        let config: Config = serde_json::from_value(raw).unwrap();
        assert_eq!(config.routing.route_finder_timeout_ms, 10_000);
        assert_eq!(config.routing.keep_alive_ms, 120_000);
        assert!(config.underlays.tcp.is_none());
        assert_eq!(config.logging.level, "info");
    }
}
