//! Relay configuration.
//!
//! Read from a TOML file; every field is optional. The file is looked up
//! in order:
//! 1. the first command-line argument
//! 2. `$WSRELAY_CONFIG`
//! 3. `~/.config/wsrelay/relay.toml`, if it exists
//!
//! With none of these, built-in defaults apply.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsrelay_server::ServerConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "WSRELAY_CONFIG";

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Do not send a client's messages back to it.
    #[serde(default)]
    pub exclude_originator: bool,

    /// Broadcast join/leave notices.
    #[serde(default = "default_true")]
    pub announce_presence: bool,

    /// Largest accepted frame payload in bytes.
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// Seconds a client has to finish the upgrade request.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Outbound frames queued per client before broadcasts to it are dropped.
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
}

fn default_host() -> String {
    ServerConfig::default().host
}

fn default_port() -> u16 {
    ServerConfig::default().port
}

fn default_true() -> bool {
    true
}

fn default_max_payload_size() -> usize {
    ServerConfig::default().max_payload_size
}

fn default_handshake_timeout_secs() -> u64 {
    ServerConfig::default().handshake_timeout.as_secs()
}

fn default_send_buffer_size() -> usize {
    ServerConfig::default().send_buffer_size
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            exclude_originator: false,
            announce_presence: default_true(),
            max_payload_size: default_max_payload_size(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            send_buffer_size: default_send_buffer_size(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.send_buffer_size == 0 {
            anyhow::bail!("send_buffer_size must be at least 1");
        }
        if self.handshake_timeout_secs == 0 {
            anyhow::bail!("handshake_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            exclude_originator: self.exclude_originator,
            announce_presence: self.announce_presence,
            max_payload_size: self.max_payload_size,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            send_buffer_size: self.send_buffer_size,
        }
    }
}

/// Picks the config file: explicit argument, then `$WSRELAY_CONFIG`, then
/// the per-user file if present.
pub fn resolve_path(arg: Option<OsString>) -> Option<PathBuf> {
    arg.or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
        .or_else(|| user_config_path().filter(|p| p.exists()))
}

/// `~/.config/wsrelay/relay.toml`.
fn user_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("wsrelay")
            .join("relay.toml"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 80);
        assert!(!config.exclude_originator);
        assert!(config.announce_presence);
        assert_eq!(config.max_payload_size, 16 * 1024 * 1024);
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.send_buffer_size, 256);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            host: "0.0.0.0".into(),
            port: 9001,
            exclude_originator: true,
            announce_presence: false,
            max_payload_size: 4096,
            handshake_timeout_secs: 3,
            send_buffer_size: 8,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn config_partial_toml() {
        // Only the port, rest should use defaults.
        let config: Config = toml::from_str("port = 8080").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
        assert!(config.announce_presence);
        assert_eq!(config.send_buffer_size, 256);
    }

    #[test]
    fn server_config_conversion() {
        let config = Config {
            handshake_timeout_secs: 5,
            exclude_originator: true,
            ..Config::default()
        };
        let server = config.server_config();
        assert_eq!(server.handshake_timeout, Duration::from_secs(5));
        assert!(server.exclude_originator);
        assert_eq!(server.host, config.host);
        assert_eq!(server.port, config.port);
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(&path, "host = \"0.0.0.0\"\nport = 9000\nexclude_originator = true\n").unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.exclude_originator);
        assert_eq!(config.handshake_timeout_secs, 10);
    }

    #[test]
    fn load_without_path_uses_defaults() {
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }

    #[test]
    fn load_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Config::load(Some(tmp.path().join("nope.toml").as_path())).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn load_rejects_bad_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");

        std::fs::write(&path, "port = \"eighty\"").unwrap();
        assert!(Config::load(Some(path.as_path())).is_err());

        std::fs::write(&path, "send_buffer_size = 0").unwrap();
        assert!(Config::load(Some(path.as_path())).is_err());
    }

    #[test]
    fn explicit_argument_wins() {
        let path = resolve_path(Some(OsString::from("/etc/wsrelay.toml")));
        assert_eq!(path, Some(PathBuf::from("/etc/wsrelay.toml")));
    }

    #[test]
    fn user_config_path_not_empty() {
        if let Some(path) = user_config_path() {
            assert!(path.ends_with("wsrelay/relay.toml"));
        }
    }
}
