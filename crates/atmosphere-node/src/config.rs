//! Layered configuration (§10.3): compiled-in defaults, overridden by
//! `ATMOSPHERE_*` environment variables, overridden in turn by CLI flags.
//! Validation happens once, here, rather than scattered through start-up.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_listen_port() -> u16 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub app_id: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_true")]
    pub enable_lan: bool,
    #[serde(default)]
    pub relay_addr: Option<SocketAddr>,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub log_no_color: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ATMOSPHERE_RELAY is not a valid host:port address: {0}")]
    BadRelayAddr(String),
    #[error("listen port {0} and relay port must both fit in a u16")]
    BadListenPort(String),
}

impl NodeConfig {
    /// Starts from compiled-in defaults, applies `ATMOSPHERE_DATA_DIR` /
    /// `ATMOSPHERE_RELAY` / `ATMOSPHERE_LISTEN_PORT` if present. CLI flags
    /// are applied afterward by the caller via the `with_*` setters, since
    /// `structopt::Opts` isn't available to this crate's plain library API.
    pub fn from_env(app_id: impl Into<String>) -> Result<Self, ConfigError> {
        let mut config = NodeConfig {
            data_dir: default_data_dir(),
            app_id: app_id.into(),
            listen_port: default_listen_port(),
            enable_lan: true,
            relay_addr: None,
            log_json: false,
            log_no_color: false,
        };
        if let Ok(dir) = std::env::var("ATMOSPHERE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("ATMOSPHERE_LISTEN_PORT") {
            config.listen_port = port.parse().map_err(|_| ConfigError::BadListenPort(port))?;
        }
        if let Ok(relay) = std::env::var("ATMOSPHERE_RELAY") {
            config.relay_addr = Some(relay.parse().map_err(|_| ConfigError::BadRelayAddr(relay))?);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_relative_data_dir() {
        std::env::remove_var("ATMOSPHERE_DATA_DIR");
        std::env::remove_var("ATMOSPHERE_RELAY");
        std::env::remove_var("ATMOSPHERE_LISTEN_PORT");
        let config = NodeConfig::from_env("com.example.app").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert!(config.enable_lan);
        assert!(config.relay_addr.is_none());
    }

    #[test]
    fn bad_relay_address_is_reported() {
        std::env::set_var("ATMOSPHERE_RELAY", "not-an-address");
        let result = NodeConfig::from_env("com.example.app");
        std::env::remove_var("ATMOSPHERE_RELAY");
        assert!(matches!(result, Err(ConfigError::BadRelayAddr(_))));
    }
}
