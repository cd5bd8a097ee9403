//! Daemon configuration
//!
//! Loaded from a TOML file with serde defaults so a missing or partial
//! file still yields a runnable monitor.

use std::net::SocketAddr;
use std::path::Path;

use cribcall_protocol::TransportKind;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Name shown to remotes during pairing and in alerts.
    pub monitor_name: String,
    /// Control-channel backend selected at startup.
    pub transport: TransportKind,
    /// Control-channel listener address.
    pub control_bind: SocketAddr,
    /// HTTPS side-channel (pairing + subscriptions) address.
    pub api_bind: SocketAddr,
    /// Default noise threshold for subscriptions that don't set one.
    pub default_threshold: f64,
    /// Default alert cooldown for subscriptions that don't set one.
    pub default_cooldown_secs: u64,
    /// Lease granted when a subscriber doesn't request one.
    pub default_lease_secs: u64,
    /// Upper clamp applied to requested leases.
    pub max_lease_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            monitor_name: "CribCall Monitor".to_string(),
            transport: TransportKind::Websocket,
            control_bind: "0.0.0.0:7460".parse().expect("valid default addr"),
            api_bind: "0.0.0.0:7461".parse().expect("valid default addr"),
            default_threshold: 50.0,
            default_cooldown_secs: 30,
            default_lease_secs: 3600,
            max_lease_secs: 86_400,
        }
    }
}

impl DaemonConfig {
    /// Load from a TOML file; absent file falls back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.transport, TransportKind::Websocket);
        assert!(config.max_lease_secs >= config.default_lease_secs);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: DaemonConfig =
            toml::from_str("monitor_name = \"Nursery\"\ntransport = \"quic\"\n").unwrap();
        assert_eq!(config.monitor_name, "Nursery");
        assert_eq!(config.transport, TransportKind::Quic);
        assert_eq!(config.default_cooldown_secs, 30);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = DaemonConfig::load(Path::new("/nonexistent/cribcall.toml")).unwrap();
        assert_eq!(config.monitor_name, "CribCall Monitor");
    }
}
