//! Configuration loading and resolution
//!
//! Each setting is resolved in this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! Command-line arguments and their environment variables are both read by
//! clap in the binaries and arrive here as [`ConfigOverrides`]. A missing
//! config file is not an error: the server starts on compiled defaults.

use crate::protocol::DEFAULT_PORT;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "PCMCAST_CONFIG";

/// Config file name inside the per-user or system config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Root of the TOML config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerSection,
    pub logging: LoggingConfig,
}

/// `[server]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host or IP address to bind the relay socket to
    pub bind_host: String,
    /// UDP port of the relay socket
    pub port: u16,
    /// Bounded wait of each control-socket receive
    pub recv_timeout_ms: u64,
    /// Start in broadcast mode without waiting for the console trigger
    pub auto_broadcast: bool,
    /// How long shutdown waits for in-flight broadcast runs
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            recv_timeout_ms: 100,
            auto_broadcast: false,
            shutdown_grace_ms: 2000,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Values supplied on the command line or through environment variables
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_host: Option<String>,
    pub port: Option<u16>,
    pub recv_timeout_ms: Option<u64>,
    pub auto_broadcast: Option<bool>,
    pub log_level: Option<String>,
}

impl TomlConfig {
    /// Parse a config file.
    ///
    /// # Errors
    /// - [`Error::Io`] if the file cannot be read
    /// - [`Error::Config`] if it is not valid TOML for this schema
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse config text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load the config file if one can be found, otherwise use defaults.
    ///
    /// An explicitly requested file (`explicit` or [`CONFIG_PATH_ENV`]) must
    /// exist and parse. A file found in a default location must parse; its
    /// absence only falls back to defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::load(Path::new(&path));
        }

        match default_config_path() {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            None => {
                warn!("No config file found, using compiled defaults");
                Ok(Self::default())
            }
        }
    }

    /// Apply command-line / environment values on top of the file values
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(host) = &overrides.bind_host {
            self.server.bind_host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(timeout) = overrides.recv_timeout_ms {
            self.server.recv_timeout_ms = timeout;
        }
        if let Some(auto) = overrides.auto_broadcast {
            self.server.auto_broadcast = auto;
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }
}

/// Resolved, validated settings for one relay server run
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub recv_timeout: Duration,
    pub auto_broadcast: bool,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            recv_timeout: Duration::from_millis(100),
            auto_broadcast: false,
            shutdown_grace: Duration::from_millis(2000),
        }
    }
}

impl ServerConfig {
    /// Validate the `[server]` section and resolve the bind address.
    ///
    /// # Errors
    /// - [`Error::Config`] if the host cannot be resolved or the receive
    ///   timeout is zero
    pub fn from_toml(config: &TomlConfig) -> Result<Self> {
        let section = &config.server;

        if section.recv_timeout_ms == 0 {
            return Err(Error::Config(
                "recv_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_addr: resolve_bind_addr(&section.bind_host, section.port)?,
            recv_timeout: Duration::from_millis(section.recv_timeout_ms),
            auto_broadcast: section.auto_broadcast,
            shutdown_grace: Duration::from_millis(section.shutdown_grace_ms),
        })
    }
}

/// Turn a host string and port into a socket address.
///
/// IP literals are used as-is; anything else goes through the system
/// resolver and the first address wins.
pub fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("Cannot resolve host {}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("Host {} resolved to no addresses", host)))
}

/// Locate the config file in its default locations.
///
/// Linux: `~/.config/pcmcast/config.toml`, then `/etc/pcmcast/config.toml`.
/// Other platforms: the per-user config directory only.
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("pcmcast").join(CONFIG_FILE_NAME));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/pcmcast").join(CONFIG_FILE_NAME);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.server.bind_host, "0.0.0.0");
        assert_eq!(config.server.port, 50007);
        assert_eq!(config.server.recv_timeout_ms, 100);
        assert!(!config.server.auto_broadcast);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_server_config_from_defaults() {
        let resolved = ServerConfig::from_toml(&TomlConfig::default()).unwrap();
        assert_eq!(resolved, ServerConfig::default());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = TomlConfig::default();
        config.server.recv_timeout_ms = 0;
        assert!(matches!(ServerConfig::from_toml(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_ip_literal() {
        let addr = resolve_bind_addr("127.0.0.1", 9000).unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        let addr = resolve_bind_addr("::1", 9000).unwrap();
        assert_eq!(addr, "[::1]:9000".parse().unwrap());
    }
}
