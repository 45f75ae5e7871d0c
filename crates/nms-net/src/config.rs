//! nms-net config loader
//!
//! Reads NMS configuration from `$NMS_HOME/config.toml` or `~/.nms/config.toml`.
//! Every field is optional; missing ones take the defaults below.

use std::fs;
use std::net::AddrParseError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nms_core::crypto::Curve;
use nms_core::wire::{FrameSigner, DEFAULT_PORT, UDP_PORT_OFFSET};
use nms_core::ProtocolError;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::handshake::ServerHandshakeCfg;
use crate::target::ConnectionTarget;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid network key: {0}")]
    NetworkKey(#[from] ProtocolError),

    #[error("unsupported curve: {0}")]
    UnknownCurve(String),

    #[error("invalid host address: {0}")]
    Host(#[from] AddrParseError),

    #[error("port {0} leaves no room for the UDP port")]
    PortOverflow(u16),
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetConfig {
    /// Server address (agent: where to connect, server: where to bind).
    pub host: String,
    /// TCP port; UDP uses `port + 1`.
    pub port: u16,
    /// Shared 32-byte frame signature key, hex. Defaults to the built-in key.
    pub network_key_hex: Option<String>,
    pub curve: String,
    /// Idle limit for an unfinished handshake.
    pub handshake_ttl_secs: u64,
    /// Idle limit for an authenticated session.
    pub session_idle_secs: u64,
    pub max_peers: usize,
    /// Identity the agent puts in NetTask frames.
    pub agent_id: u32,
    /// Housekeeping interval of the endpoint loop.
    pub tick_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            network_key_hex: None,
            curve: Curve::X25519.name().to_string(),
            handshake_ttl_secs: 30,
            session_idle_secs: 600,
            max_peers: 1024,
            agent_id: 1,
            tick_ms: 1000,
        }
    }
}

impl NetConfig {
    /// Returns `$NMS_HOME/config.toml` if set, else `~/.nms/config.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(home) = std::env::var("NMS_HOME") {
            return PathBuf::from(home).join("config.toml");
        }
        let mut p = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        p.push(".nms");
        p.push("config.toml");
        p
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&txt)
    }

    pub fn from_toml_str(txt: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(txt)?)
    }

    pub fn signer(&self) -> Result<FrameSigner, ConfigError> {
        match &self.network_key_hex {
            Some(k) => Ok(FrameSigner::from_hex(k)?),
            None => Ok(FrameSigner::default()),
        }
    }

    pub fn curve(&self) -> Result<Curve, ConfigError> {
        Curve::from_name(&self.curve).ok_or_else(|| ConfigError::UnknownCurve(self.curve.clone()))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }

    pub fn handshake_cfg(&self) -> Result<ServerHandshakeCfg, ConfigError> {
        Ok(ServerHandshakeCfg {
            curve: self.curve()?,
            handshake_ttl: Duration::from_secs(self.handshake_ttl_secs),
            session_idle_ttl: Duration::from_secs(self.session_idle_secs),
            max_peers: self.max_peers,
        })
    }

    pub fn tcp_target(&self) -> Result<ConnectionTarget, ConfigError> {
        Ok(ConnectionTarget::parse(&self.host, self.port)?)
    }

    pub fn udp_target(&self) -> Result<ConnectionTarget, ConfigError> {
        self.tcp_target()?
            .with_port_offset(UDP_PORT_OFFSET)
            .ok_or(ConfigError::PortOverflow(self.port))
    }

    /// Log a one-line summary.
    pub fn debug_banner(&self) {
        info!(
            host = %self.host,
            port = self.port,
            curve = %self.curve,
            custom_key = self.network_key_hex.is_some(),
            handshake_ttl_secs = self.handshake_ttl_secs,
            max_peers = self.max_peers,
            "config"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_port_convention() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.tcp_target().unwrap().qualified_name(), "127.0.0.1:2022");
        assert_eq!(cfg.udp_target().unwrap().qualified_name(), "127.0.0.1:2023");
        assert_eq!(cfg.curve().unwrap(), Curve::X25519);
        assert_eq!(
            cfg.handshake_cfg().unwrap().handshake_ttl,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = NetConfig::from_toml_str("port = 4000\nagent_id = 7\n").unwrap();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.agent_id, 7);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.max_peers, 1024);
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(NetConfig::from_toml_str("port = \"x\"").is_err());

        let cfg = NetConfig {
            curve: "secp128r1".into(),
            ..NetConfig::default()
        };
        assert!(matches!(cfg.curve(), Err(ConfigError::UnknownCurve(_))));

        let cfg = NetConfig {
            network_key_hex: Some("abcd".into()),
            ..NetConfig::default()
        };
        assert!(matches!(cfg.signer(), Err(ConfigError::NetworkKey(_))));

        let cfg = NetConfig {
            port: u16::MAX,
            ..NetConfig::default()
        };
        assert!(matches!(cfg.udp_target(), Err(ConfigError::PortOverflow(_))));
    }

    #[test]
    fn missing_file_is_default() {
        let cfg = NetConfig::load_from(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(cfg, NetConfig::default());
    }
}
