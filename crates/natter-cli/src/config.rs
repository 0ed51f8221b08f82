//! Configuration system for the natter CLI.

use natter_traversal::upnp::{CommandConfig, DiscoveryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// natter configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// STUN configuration
    #[serde(default)]
    pub stun: StunConfig,
    /// UPnP configuration
    #[serde(default)]
    pub upnp: UpnpConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// STUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunConfig {
    /// STUN server host name
    #[serde(default = "default_stun_server")]
    pub server: String,
    /// STUN server port
    #[serde(default = "default_stun_port")]
    pub port: u16,
    /// How long to wait for a reply
    #[serde(default = "default_stun_timeout")]
    pub timeout_secs: u64,
}

/// UPnP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpnpConfig {
    /// Multicast interface: IPv4 address, or interface name for IPv6
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Local address to search from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
    /// Receive window after each M-SEARCH
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Deadline for downloading a device description
    #[serde(default = "default_description_timeout")]
    pub description_timeout_secs: u64,
    /// Deadline for a SOAP command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Description attached to new port mappings
    #[serde(default = "default_mapping_description")]
    pub mapping_description: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_stun_server() -> String {
    "stun.cloudflare.com".to_string()
}

fn default_stun_port() -> u16 {
    3478
}

fn default_stun_timeout() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_description_timeout() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    15
}

fn default_mapping_description() -> String {
    "natter".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            server: default_stun_server(),
            port: default_stun_port(),
            timeout_secs: default_stun_timeout(),
        }
    }
}

impl Default for UpnpConfig {
    fn default() -> Self {
        Self {
            interface: None,
            bind_addr: None,
            probe_timeout_secs: default_probe_timeout(),
            description_timeout_secs: default_description_timeout(),
            command_timeout_secs: default_command_timeout(),
            mapping_description: default_mapping_description(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("natter/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the UPnP bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not an IP address.
    pub fn parse_bind_addr(&self) -> anyhow::Result<Option<IpAddr>> {
        self.upnp
            .bind_addr
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|_| anyhow::anyhow!("Invalid UPnP bind address: {}", addr))
            })
            .transpose()
    }

    /// Discovery settings derived from the `[upnp]` section
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn discovery_config(&self) -> anyhow::Result<DiscoveryConfig> {
        Ok(DiscoveryConfig {
            interface: self.upnp.interface.clone(),
            bind_addr: self.parse_bind_addr()?,
            probe_timeout: Duration::from_secs(self.upnp.probe_timeout_secs),
            description_timeout: Duration::from_secs(self.upnp.description_timeout_secs),
            command: self.command_config(),
            ..DiscoveryConfig::default()
        })
    }

    /// SOAP command settings derived from the `[upnp]` section
    #[must_use]
    pub fn command_config(&self) -> CommandConfig {
        CommandConfig {
            timeout: Duration::from_secs(self.upnp.command_timeout_secs),
            ..CommandConfig::default()
        }
    }

    /// STUN reply timeout
    #[must_use]
    pub fn stun_timeout(&self) -> Duration {
        Duration::from_secs(self.stun.timeout_secs)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate STUN server
        if self.stun.server.is_empty() {
            anyhow::bail!("STUN server must not be empty");
        }
        if self.stun.server.contains('/') || self.stun.server.contains(char::is_whitespace) {
            anyhow::bail!("STUN server '{}' contains invalid characters", self.stun.server);
        }
        if self.stun.port == 0 {
            anyhow::bail!("STUN port must not be 0");
        }
        if self.stun.timeout_secs == 0 {
            anyhow::bail!("STUN timeout must be at least 1 second");
        }

        // Validate UPnP settings
        self.parse_bind_addr()?;
        if self.upnp.probe_timeout_secs == 0 || self.upnp.probe_timeout_secs > 60 {
            anyhow::bail!("UPnP probe timeout must be between 1 and 60 seconds");
        }
        if self.upnp.description_timeout_secs == 0 {
            anyhow::bail!("UPnP description timeout must be at least 1 second");
        }
        if self.upnp.command_timeout_secs == 0 {
            anyhow::bail!("UPnP command timeout must be at least 1 second");
        }

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.stun.port, 3478);
        assert_eq!(config.upnp.probe_timeout_secs, 3);
        assert_eq!(config.upnp.command_timeout_secs, 15);
        assert_eq!(config.upnp.mapping_description, "natter");
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.upnp.bind_addr = Some("not-an-ip".to_string());
        assert!(config.validate().is_err());

        config.upnp.bind_addr = Some("192.168.1.20".to_string());
        assert!(config.validate().is_ok());

        config.stun.port = 0;
        assert!(config.validate().is_err());

        config.stun.port = 3478;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [stun]
            server = "stun.example.org"

            [upnp]
            interface = "eth0"
            "#,
        )
        .unwrap();
        assert_eq!(config.stun.server, "stun.example.org");
        assert_eq!(config.stun.port, 3478);
        assert_eq!(config.upnp.interface.as_deref(), Some("eth0"));
        assert_eq!(config.upnp.description_timeout_secs, 60);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_discovery_config() {
        let mut config = Config::default();
        config.upnp.bind_addr = Some("::1".to_string());
        config.upnp.probe_timeout_secs = 1;

        let discovery = config.discovery_config().unwrap();
        assert_eq!(discovery.bind_addr, Some("::1".parse().unwrap()));
        assert_eq!(discovery.probe_timeout, Duration::from_secs(1));
        assert_eq!(discovery.command.timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.stun.server = "stun.example.net".to_string();
        config.upnp.interface = Some("192.168.1.20".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.stun.server, "stun.example.net");
        assert_eq!(loaded.upnp.interface.as_deref(), Some("192.168.1.20"));
        assert_eq!(loaded.upnp.bind_addr, None);
    }
}
