//! Configuration management.
//!
//! Berth configuration is loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`BERTH_*`, sections split on `__`)
//! 2. Configuration file (`--config`, or ~/.config/berth/config.toml)
//! 3. System configuration file (/etc/berth/config.toml)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! [api]
//! socket_path = "/run/berth/berth.sock"
//! tcp_addr = "127.0.0.1:2375"
//!
//! [manager]
//! default_detach_keys = "ctrl-p,ctrl-q"
//! shutdown_timeout_secs = 10
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Berth daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API server configuration.
    pub api: ApiConfig,
    /// Container manager configuration.
    pub manager: ManagerConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from files and environment.
    ///
    /// `path` replaces the user config file. Unlike the implicit files it
    /// must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be parsed, a value has the wrong
    /// type, or `path` does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(system_config_path()));

        let figment = match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(figment::Error::from(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                figment.merge(Toml::file(path))
            }
            None => figment.merge(Toml::file(user_config_path())),
        };

        figment.merge(Env::prefixed("BERTH_").split("__")).extract()
    }
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Unix socket path.
    pub socket_path: PathBuf,
    /// Optional plain TCP listener. There is no TLS or auth; keep it on
    /// loopback.
    pub tcp_addr: Option<SocketAddr>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            socket_path: berth_api::server::default_socket_path(),
            tcp_addr: None,
        }
    }
}

/// Container manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Detach keys for sessions that did not ask for any, Docker format.
    pub default_detach_keys: Option<String>,
    /// Grace period given to each running container on daemon shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_detach_keys: None,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    pub level: String,
    /// Log format (text, json).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("berth")
        .join("config.toml")
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/berth/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.api.socket_path.ends_with("berth.sock"));
        assert!(config.api.tcp_addr.is_none());
        assert!(config.manager.default_detach_keys.is_none());
        assert_eq!(config.manager.shutdown_timeout_secs, 10);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    // Loading reads BERTH_* variables, so every load runs inside a Jail,
    // which serializes env access across tests.

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[api]
socket_path = "/tmp/berth-test.sock"
tcp_addr = "127.0.0.1:2375"

[manager]
default_detach_keys = "ctrl-x,x"

[logging]
format = "json"
"#
        )
        .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(file.path()))?;
            assert_eq!(config.api.socket_path, PathBuf::from("/tmp/berth-test.sock"));
            assert_eq!(
                config.api.tcp_addr,
                Some("127.0.0.1:2375".parse().unwrap())
            );
            assert_eq!(config.manager.default_detach_keys.as_deref(), Some("ctrl-x,x"));
            // Untouched keys keep their defaults.
            assert_eq!(config.manager.shutdown_timeout_secs, 10);
            assert_eq!(config.logging.level, "info");
            assert_eq!(config.logging.format, "json");
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        figment::Jail::expect_with(|_jail| {
            assert!(Config::load(Some(&missing)).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[manager]\nshutdown_timeout_secs = \"soon\"").unwrap();
        figment::Jail::expect_with(|_jail| {
            assert!(Config::load(Some(file.path())).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "berth.toml",
                "[manager]\nshutdown_timeout_secs = 30\n",
            )?;
            jail.set_env("BERTH_MANAGER__SHUTDOWN_TIMEOUT_SECS", "3");
            jail.set_env("BERTH_LOGGING__LEVEL", "debug");

            let config = Config::load(Some(Path::new("berth.toml")))?;
            assert_eq!(config.manager.shutdown_timeout_secs, 3);
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }
}
