//! Server configuration
//!
//! Defaults, an optional TOML config file, and `key=value` overrides from
//! the `server` subcommand, layered in that order.

use std::net::SocketAddr;
use std::path::PathBuf;

use common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::listener::USBIP_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub state: StateSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the USB/IP listener binds
    #[serde(default = "ServerSettings::default_bind")]
    pub bind_addr: String,
    /// USB/IP TCP port
    #[serde(default = "ServerSettings::default_port")]
    pub port: u16,
    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "ServerSettings::default_log_level")]
    pub log_level: String,
}

impl ServerSettings {
    fn default_bind() -> String {
        "0.0.0.0".to_owned()
    }

    fn default_port() -> u16 {
        USBIP_PORT
    }

    fn default_log_level() -> String {
        "info".to_owned()
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind(),
            port: Self::default_port(),
            log_level: Self::default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSettings {
    /// Where the persisted share table lives; defaults next to the app data
    #[serde(default)]
    pub share_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            state: StateSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbipd").join("server.toml")
        } else {
            PathBuf::from("usbipd-server.toml")
        }
    }

    /// Load from an explicit path, or the default path if it exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let raw = std::fs::read_to_string(&path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Layer `key=value` pairs over this configuration
    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<()> {
        for pair in overrides {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::Config(format!("override {:?} is not of the form key=value", pair))
            })?;
            match key {
                "bind" => self.server.bind_addr = value.to_owned(),
                "port" => {
                    self.server.port = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid port {:?}", value)))?;
                }
                "log" | "log_level" => self.server.log_level = value.to_owned(),
                "state" => self.state.share_file = Some(PathBuf::from(value)),
                other => {
                    return Err(Error::Config(format!(
                        "unknown configuration key {:?} (known: bind, port, log, state)",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    /// The socket address the listener binds
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.bind_addr, self.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))
    }

    /// Where the share table is persisted
    pub fn share_file(&self) -> PathBuf {
        if let Some(ref path) = self.state.share_file {
            return path.clone();
        }
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("usbipd").join("shares.toml")
        } else {
            PathBuf::from("usbipd-shares.toml")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_speak_usbip() {
        let config = ServerConfig::default();
        assert_eq!(config.server.port, 3240);
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.listen_addr().unwrap().port(), 3240);
    }

    #[test]
    fn overrides_layer_over_defaults() {
        let mut config = ServerConfig::default();
        config
            .apply_overrides(&["bind=127.0.0.1", "port=13240", "log=debug"])
            .unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.server.port, 13240);
        assert_eq!(config.server.log_level, "debug");
    }

    #[test]
    fn bad_overrides_are_rejected() {
        let mut config = ServerConfig::default();
        assert!(config.apply_overrides(&["port"]).is_err());
        assert!(config.apply_overrides(&["port=never"]).is_err());
        assert!(config.apply_overrides(&["colour=red"]).is_err());
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");

        let mut config = ServerConfig::default();
        config.server.port = 13240;
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = ServerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.server.port, 13240);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "[server]\nport = 13240\n").unwrap();

        let loaded = ServerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.server.port, 13240);
        assert_eq!(loaded.server.bind_addr, "0.0.0.0");
        assert_eq!(loaded.server.log_level, "info");
    }
}
