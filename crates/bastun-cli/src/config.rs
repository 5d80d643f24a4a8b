//! CLI configuration at `~/.bastun/config.toml`.
//!
//! Holds relay tuning and a list of known gateways, so a tunnel can be
//! opened by resource group and name without a control-plane round trip.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use bastun_core::gateway::{GatewayDescriptor, Sku};
use bastun_relay::RelayConfig;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelaySettings,

    /// Known gateways (`[[gateway]]` tables).
    #[serde(default, rename = "gateway")]
    pub gateways: Vec<GatewayEntry>,
}

/// Relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Host the local listener binds to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Keepalive ping interval while forwarding; 0 disables it.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            handshake_timeout_secs: default_handshake_timeout(),
            keepalive_secs: default_keepalive(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_keepalive() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    16 * 1024
}

impl RelaySettings {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            keepalive_interval: (self.keepalive_secs > 0)
                .then(|| Duration::from_secs(self.keepalive_secs)),
            buffer_size: self.buffer_size.max(1),
            ..RelayConfig::default()
        }
    }
}

/// A gateway known to the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEntry {
    pub resource_group: String,
    pub name: String,
    #[serde(default)]
    pub id: String,
    pub dns_name: String,
    #[serde(default = "default_sku")]
    pub sku: String,
    #[serde(default)]
    pub enable_tunneling: bool,
}

fn default_sku() -> String {
    "Standard".to_string()
}

impl GatewayEntry {
    pub fn matches(&self, resource_group: &str, name: &str) -> bool {
        self.resource_group.eq_ignore_ascii_case(resource_group)
            && self.name.eq_ignore_ascii_case(name)
    }

    pub fn descriptor(&self) -> GatewayDescriptor {
        GatewayDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            dns_name: self.dns_name.clone(),
            sku: Sku {
                name: self.sku.clone(),
            },
            enable_tunneling: Some(self.enable_tunneling),
        }
    }
}

/// `~/.bastun/config.toml`.
pub fn default_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_default();
    home.join(".bastun").join("config.toml")
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), gateways = config.gateways.len(), "loaded config");
        Ok(config)
    }
}
