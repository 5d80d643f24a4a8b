//! Subcommand implementations.

pub mod rdp;
pub mod ssh;
pub mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bastun_core::{GatewayDescriptor, GatewayLookup, TargetSpec};
use bastun_relay::{LifecycleController, StopReason, TunnelServer};

use crate::config::Config;
use crate::credential::CliCredential;
use crate::gateway::{ConfigGatewayLookup, FileGatewayLookup};
use crate::launcher::LocalClientLauncher;

/// Gateway and target selection shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Resource id of the target host
    #[arg(long = "target-resource-id")]
    pub target_resource_id: String,

    /// Resource group of the gateway
    #[arg(short = 'g', long = "resource-group")]
    pub resource_group: String,

    /// Name of the gateway
    #[arg(short = 'n', long = "name")]
    pub name: String,
}

/// Settings resolved from global flags and the config file.
pub struct CommandContext {
    pub config: Config,
    pub gateway_file: Option<PathBuf>,
    pub access_token: Option<String>,
}

impl CommandContext {
    fn lookup(&self) -> Box<dyn GatewayLookup> {
        match &self.gateway_file {
            Some(path) => Box::new(FileGatewayLookup::new(path)),
            None => Box::new(ConfigGatewayLookup::new(self.config.gateways.clone())),
        }
    }

    /// Validate the target, then resolve the credential and the gateway.
    pub async fn resolve(&self, target: &TargetArgs, resource_port: &str) -> Result<Resolved> {
        let target_spec = TargetSpec::parse(&target.target_resource_id, resource_port)?;

        let credential = CliCredential::new(self.access_token.clone());
        let token = credential.resolve()?;
        debug!(token = %token, "using access token");

        let gateway = self
            .lookup()
            .lookup(&target.resource_group, &target.name)
            .await
            .with_context(|| format!("failed to resolve gateway '{}'", target.name))?;

        Ok(Resolved {
            target: target_spec,
            gateway,
            credential,
        })
    }

    /// Validate the target, resolve the gateway and credential, and build
    /// an unstarted tunnel server.
    pub async fn build_server(
        &self,
        target: &TargetArgs,
        resource_port: &str,
        local_port: u16,
    ) -> Result<Arc<TunnelServer>> {
        let resolved = self.resolve(target, resource_port).await?;
        let server = TunnelServer::new(
            self.config.relay.bind_host.clone(),
            local_port,
            resolved.gateway,
            resolved.target,
            Arc::new(resolved.credential),
        )?
        .with_config(self.config.relay.relay_config());
        Ok(Arc::new(server))
    }
}

/// A validated target with its gateway and credential.
pub struct Resolved {
    pub target: TargetSpec,
    pub gateway: GatewayDescriptor,
    pub credential: CliCredential,
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Cancel `token` when the operator interrupts the process.
pub fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = shutdown_signal() => {
                info!("Ctrl + C received. Clean up and then exit.");
                token.cancel();
            }
        }
    });
}

/// Start `server`, run the local client against it, and stop the tunnel
/// through a [`LifecycleController`] once the client exits or the operator
/// interrupts.
pub async fn run_with_client(
    server: Arc<TunnelServer>,
    launcher: &dyn LocalClientLauncher,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let controller = LifecycleController::new(server.clone(), cancel.clone());

    let result = async {
        let port = server.start_server().await.context("failed to start tunnel")?;
        let command = launcher.command(port)?;
        debug!(command = %command, "running {}", launcher.name());
        cancel_on_interrupt(cancel.clone());

        tokio::select! {
            status = command.run() => {
                let status = status?;
                if !status.success() {
                    warn!(code = ?status.code(), "{} exited with failure", launcher.name());
                }
                Ok::<_, anyhow::Error>(StopReason::ClientExited)
            }
            _ = cancel.cancelled() => Ok(StopReason::Interrupted),
        }
    }
    .await;

    let reason = match &result {
        Ok(reason) => *reason,
        Err(_) => StopReason::ClientExited,
    };
    let reason = controller.stop(reason).await;
    cancel.cancel();
    info!(?reason, "tunnel closed");
    result.map(|_| ())
}
