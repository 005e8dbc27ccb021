//! Room configuration
//!
//! Everything has a default, so an empty JSON object is a valid config file.

use crate::peer::types::{IceServerKind, ServerConfig};
use crate::signaling::relay::ReconnectPolicy;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN/TURN servers handed to every peer connection
    pub ice_servers: Vec<ServerConfig>,

    /// How long to wait for key announces after joining before reporting discovery
    pub discovery_window_ms: u64,

    /// Deadline for a session to reach the connected state
    pub negotiation_timeout_ms: u64,

    /// Time a disconnected/failed connection gets to recover before it is torn down
    pub grace_period_ms: u64,

    /// Relay reconnect policy
    pub reconnect: ReconnectPolicy,

    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            discovery_window_ms: 1_000,
            negotiation_timeout_ms: 30_000,
            grace_period_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

impl MeshConfig {
    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: MeshConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }

            if server.kind == IceServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.grace_period_ms == 0 {
            return Err(Error::InvalidConfig(
                "grace_period_ms must be greater than 0".to_string(),
            ));
        }

        self.reconnect.validate()
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.grace_period(), Duration::from_secs(10));
    }

    #[test]
    fn test_turn_requires_credentials() {
        let mut config = MeshConfig::default();
        config.ice_servers.push(ServerConfig {
            id: "relay".into(),
            kind: IceServerKind::Turn,
            url: "turn:relay.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        });
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut config = MeshConfig::default();
        config.ice_servers = vec![ServerConfig::stun("blank", "")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "grace_period_ms": 2500, "reconnect": {{ "max_retries": 2 }} }}"#
        )
        .unwrap();

        let config = MeshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.grace_period_ms, 2500);
        assert_eq!(config.reconnect.max_retries, 2);
        assert_eq!(config.discovery_window_ms, 1_000);
    }

    #[test]
    fn test_from_file_rejects_zero_timeout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "negotiation_timeout_ms": 0 }}"#).unwrap();
        assert!(MeshConfig::from_file(file.path()).is_err());
    }
}
