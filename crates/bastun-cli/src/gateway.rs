//! Gateway resolution for the CLI.
//!
//! Gateways come either from `[[gateway]]` entries in the config file or
//! from a JSON document in the control plane's own shape (`--gateway-file`).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tracing::debug;

use bastun_core::{GatewayDescriptor, GatewayLookup, TunnelError, TunnelResult};

use crate::config::GatewayEntry;

/// Looks gateways up in the config file.
pub struct ConfigGatewayLookup {
    entries: Vec<GatewayEntry>,
}

impl ConfigGatewayLookup {
    pub fn new(entries: Vec<GatewayEntry>) -> Self {
        Self { entries }
    }
}

impl GatewayLookup for ConfigGatewayLookup {
    fn lookup<'a>(
        &'a self,
        resource_group: &'a str,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<GatewayDescriptor>> + Send + 'a>> {
        Box::pin(async move {
            self.entries
                .iter()
                .find(|entry| entry.matches(resource_group, name))
                .map(GatewayEntry::descriptor)
                .ok_or_else(|| {
                    TunnelError::Lookup(format!(
                        "gateway '{name}' not found in resource group '{resource_group}'"
                    ))
                })
        })
    }
}

/// Reads one gateway descriptor from a JSON file.
pub struct FileGatewayLookup {
    path: PathBuf,
}

impl FileGatewayLookup {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GatewayLookup for FileGatewayLookup {
    fn lookup<'a>(
        &'a self,
        _resource_group: &'a str,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<GatewayDescriptor>> + Send + 'a>> {
        Box::pin(async move {
            let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                TunnelError::Lookup(format!("cannot read {}: {e}", self.path.display()))
            })?;
            let descriptor = GatewayDescriptor::from_json(&json)?;
            if !descriptor.name.is_empty() && !descriptor.name.eq_ignore_ascii_case(name) {
                return Err(TunnelError::Lookup(format!(
                    "{} describes gateway '{}', not '{name}'",
                    self.path.display(),
                    descriptor.name
                )));
            }
            debug!(path = %self.path.display(), gateway = %descriptor.name, "loaded gateway descriptor");
            Ok(descriptor)
        })
    }
}
