//! Gateway descriptors and the lookup collaborator that produces them.
//!
//! A [`GatewayDescriptor`] deserializes straight from the control plane's
//! JSON representation of a gateway (camelCase keys, unknown keys ignored),
//! so the output of a `show` call can be handed to the relay unchanged.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};

/// Path of the tunnel endpoint on the gateway host.
pub const TUNNEL_PATH: &str = "/webtunnelv2";

/// Gateway SKU tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkuTier {
    Developer,
    Basic,
    Standard,
    Premium,
    Unknown,
}

impl SkuTier {
    /// Tiers that never offer native-client tunneling.
    pub fn supports_tunneling(self) -> bool {
        !matches!(self, SkuTier::Developer | SkuTier::Basic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sku {
    pub name: String,
}

impl Sku {
    pub fn tier(&self) -> SkuTier {
        match self.name.to_ascii_lowercase().as_str() {
            "developer" => SkuTier::Developer,
            "basic" => SkuTier::Basic,
            "standard" => SkuTier::Standard,
            "premium" => SkuTier::Premium,
            _ => SkuTier::Unknown,
        }
    }
}

/// Immutable description of the managed gateway a tunnel goes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDescriptor {
    /// Resource id of the gateway instance.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// DNS name of the gateway endpoint. May carry an explicit `ws://` or
    /// `wss://` scheme, in which case it is used verbatim as the tunnel URL.
    pub dns_name: String,
    pub sku: Sku,
    #[serde(default)]
    pub enable_tunneling: Option<bool>,
}

impl GatewayDescriptor {
    /// Parse a descriptor from the control plane's JSON document.
    pub fn from_json(json: &str) -> TunnelResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check that this gateway permits native-client tunneling.
    ///
    /// Pure: performs no I/O, so callers can run it before touching the
    /// network.
    pub fn ensure_tunneling_supported(&self) -> TunnelResult<()> {
        if self.dns_name.trim().is_empty() {
            return Err(TunnelError::Configuration(format!(
                "gateway '{}' has no DNS name",
                self.name
            )));
        }
        if !self.sku.tier().supports_tunneling() || self.enable_tunneling != Some(true) {
            return Err(TunnelError::Configuration(
                "Bastion Host SKU must be Standard or Premium and Native Client must be enabled."
                    .into(),
            ));
        }
        Ok(())
    }

    /// WebSocket URL of the tunnel endpoint.
    pub fn tunnel_url(&self) -> String {
        let dns = self.dns_name.trim();
        let lower = dns.to_ascii_lowercase();
        if lower.starts_with("ws://") || lower.starts_with("wss://") {
            dns.to_string()
        } else {
            format!("wss://{}{}", dns.trim_end_matches('/'), TUNNEL_PATH)
        }
    }
}

/// Resolves a gateway by resource group and name.
///
/// Implemented by whatever owns control-plane access; the relay only ever
/// consumes the resulting descriptor.
pub trait GatewayLookup: Send + Sync {
    fn lookup<'a>(
        &'a self,
        resource_group: &'a str,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<GatewayDescriptor>> + Send + 'a>>;
}
