//! Configuration structures for tcplogd
//!
//! Values are layered: built-in defaults, then an optional TOML file, then the
//! environment variables the daemon has always understood (`PORT`, `FILENAME`,
//! `MAXSIZE`, ...). A variable that is unset or empty keeps the lower layer's
//! value.

use crate::{Result, TcpLogError};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

/// Environment variables and the configuration keys they override
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("PORT", "listener.port"),
    ("PROTOCOL", "listener.protocol"),
    ("ADDRESS", "listener.address"),
    ("FILENAME", "sink.filename"),
    ("MAXSIZE", "sink.max_size_mb"),
    ("MAXAGE", "sink.max_age_days"),
    ("MAXBACKUP", "sink.max_backups"),
    ("COMPRESS", "sink.compress"),
    ("USELOCALTIME", "sink.local_time"),
];

/// Size used when `max_size_mb` is zero
pub const DEFAULT_MAX_SIZE_MB: u64 = 100;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listening socket settings
    pub listener: ListenerSettings,
    /// Rotating log file settings
    pub sink: SinkSettings,
    /// Handoff queue between connections and the writer
    pub dispatch: DispatchSettings,
}

/// Transport the listener binds with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP over IPv4 or IPv6, whichever the address resolves to first
    Tcp,
    /// TCP restricted to IPv4 addresses
    Tcp4,
    /// TCP restricted to IPv6 addresses
    Tcp6,
    /// Unix domain stream socket; the address is the socket path
    Unix,
}

/// Listening socket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Transport name
    pub protocol: Protocol,
    /// Host to bind (empty means all interfaces), or socket path for `unix`
    pub address: String,
    /// TCP port; 0 lets the OS pick one
    pub port: u16,
}

/// Rotating log file settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Path of the active log file
    pub filename: PathBuf,
    /// Rotate once the file would grow past this many megabytes (0 = 100)
    pub max_size_mb: u64,
    /// Delete backups older than this many days (0 = never)
    pub max_age_days: u32,
    /// Number of backups to keep (0 = all)
    pub max_backups: usize,
    /// Gzip backups after rotation
    pub compress: bool,
    /// Stamp backup names with local time instead of UTC
    pub local_time: bool,
}

/// Dispatch channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Number of records buffered between connections and the writer
    pub capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listener: ListenerSettings {
                protocol: Protocol::Tcp,
                address: "localhost".to_string(),
                port: 8080,
            },
            sink: SinkSettings {
                filename: PathBuf::from("/var/log/openwrt/openwrt.log"),
                max_size_mb: 0,
                max_age_days: 180,
                max_backups: 0,
                compress: false,
                local_time: true,
            },
            dispatch: DispatchSettings { capacity: 5 },
        }
    }
}

impl Protocol {
    /// Name as accepted in configuration
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Tcp4 => "tcp4",
            Protocol::Tcp6 => "tcp6",
            Protocol::Unix => "unix",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TcpLogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "tcp4" => Ok(Protocol::Tcp4),
            "tcp6" => Ok(Protocol::Tcp6),
            "unix" => Ok(Protocol::Unix),
            other => Err(TcpLogError::Config(format!(
                "Unsupported protocol '{}' (expected tcp, tcp4, tcp6 or unix)",
                other
            ))),
        }
    }
}

impl SinkSettings {
    /// Rotation threshold in bytes, saturating at `u64::MAX`
    pub fn max_size_bytes(&self) -> u64 {
        self.checked_max_size_bytes().unwrap_or(u64::MAX)
    }

    fn checked_max_size_bytes(&self) -> Option<u64> {
        let mb = if self.max_size_mb == 0 {
            DEFAULT_MAX_SIZE_MB
        } else {
            self.max_size_mb
        };
        mb.checked_mul(1024 * 1024)
    }
}

impl ServerConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::load`], reading environment values through
    /// `lookup` instead of the process environment
    pub fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Config::builder().add_source(Config::try_from(&ServerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        for &(var, key) in ENV_OVERRIDES {
            match lookup(var) {
                None => info!(var, "env var not set, keeping configured value"),
                Some(value) if value.is_empty() => {
                    info!(var, "env var set but empty, keeping configured value")
                }
                Some(value) => {
                    let value = if var == "PROTOCOL" {
                        value.parse::<Protocol>()?.as_str().to_string()
                    } else {
                        value
                    };
                    builder = builder.set_override(key, value)?;
                }
            }
        }

        let config: ServerConfig = builder
            .build()?
            .try_deserialize()
            .map_err(|e| TcpLogError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, ignoring the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TcpLogError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| TcpLogError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener.protocol == Protocol::Unix && self.listener.address.is_empty() {
            return Err(TcpLogError::Config(
                "Socket path cannot be empty for the unix protocol".to_string(),
            ));
        }
        if self.sink.checked_max_size_bytes().is_none() {
            return Err(TcpLogError::Config(format!(
                "Max size of {} MB does not fit in a 64-bit byte count",
                self.sink.max_size_mb
            )));
        }
        if self.sink.filename.as_os_str().is_empty() {
            return Err(TcpLogError::Config("Log filename cannot be empty".to_string()));
        }
        if self.dispatch.capacity == 0 {
            return Err(TcpLogError::Config(
                "Dispatch capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = ServerConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.listener.address, "localhost");
        assert_eq!(config.sink.max_age_days, 180);
        assert!(config.sink.local_time);
        assert_eq!(config.dispatch.capacity, 5);
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::load_with_env(
            None,
            env(&[
                ("PORT", "5555"),
                ("ADDRESS", ""),
                ("PROTOCOL", "TCP4"),
                ("FILENAME", "/tmp/router.log"),
                ("MAXSIZE", "10"),
                ("MAXBACKUP", "3"),
                ("COMPRESS", "true"),
                ("USELOCALTIME", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(config.listener.port, 5555);
        assert_eq!(config.listener.protocol, Protocol::Tcp4);
        assert_eq!(config.sink.filename, PathBuf::from("/tmp/router.log"));
        assert_eq!(config.sink.max_size_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.sink.max_backups, 3);
        assert!(config.sink.compress);
        assert!(!config.sink.local_time);
    }

    #[test]
    fn test_empty_env_keeps_default() {
        let config =
            ServerConfig::load_with_env(None, env(&[("ADDRESS", ""), ("MAXAGE", "")])).unwrap();
        assert_eq!(config.listener.address, "localhost");
        assert_eq!(config.sink.max_age_days, 180);
    }

    #[test]
    fn test_unparsable_env_value_is_rejected() {
        let result = ServerConfig::load_with_env(None, env(&[("PORT", "not-a-port")]));
        assert!(matches!(result, Err(TcpLogError::Config(_))));

        let result = ServerConfig::load_with_env(None, env(&[("PROTOCOL", "udp")]));
        assert!(matches!(result, Err(TcpLogError::Config(_))));
    }

    #[test]
    fn test_env_wins_over_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[listener]\nport = 9000\naddress = \"0.0.0.0\"\n\n[dispatch]\ncapacity = 64"
        )
        .unwrap();

        let config =
            ServerConfig::load_with_env(Some(file.path()), env(&[("PORT", "9100")])).unwrap();
        assert_eq!(config.listener.port, 9100);
        assert_eq!(config.listener.address, "0.0.0.0");
        assert_eq!(config.dispatch.capacity, 64);
        assert_eq!(config.sink.max_age_days, 180);
    }

    #[test]
    fn test_from_file_roundtrips_rendered_config() {
        let mut config = ServerConfig::default();
        config.listener.protocol = Protocol::Unix;
        config.listener.address = "/run/tcplogd.sock".to_string();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        assert_eq!(ServerConfig::from_file(file.path()).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.dispatch.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.sink.filename = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.listener.protocol = Protocol::Unix;
        config.listener.address.clear();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.listener.port = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_max_size_is_rejected() {
        let result = ServerConfig::load_with_env(None, env(&[("MAXSIZE", "18000000000000")]));
        assert!(matches!(result, Err(TcpLogError::Config(_))));

        let mut sink = ServerConfig::default().sink;
        sink.max_size_mb = 18_000_000_000_000;
        assert_eq!(sink.max_size_bytes(), u64::MAX);

        sink.max_size_mb = u64::MAX / (1024 * 1024);
        assert!(sink.checked_max_size_bytes().is_some());
    }

    #[test]
    fn test_zero_max_size_means_default() {
        let sink = ServerConfig::default().sink;
        assert_eq!(sink.max_size_bytes(), DEFAULT_MAX_SIZE_MB * 1024 * 1024);
    }
}
