//! `bastun rdp`: connect the Windows Remote Desktop client to the target.
//!
//! By default the gateway generates the connection file and the client talks
//! to the gateway directly. `--disable-gateway` opens a local tunnel instead
//! and points the client at it.

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use bastun_core::resource::DEFAULT_RDP_PORT;

use super::{run_with_client, CommandContext, TargetArgs};
use crate::launcher::RdpLauncher;
use crate::rdpfile;

#[derive(Debug, Clone, Copy, Default)]
pub struct RdpOptions {
    pub disable_gateway: bool,
    /// Open the connection file in the editor first.
    pub configure: bool,
    pub enable_mfa: bool,
}

pub async fn run(
    ctx: &CommandContext,
    target: &TargetArgs,
    resource_port: Option<&str>,
    options: RdpOptions,
) -> Result<()> {
    if !cfg!(windows) {
        bail!("Platform is not supported for this command. Supported platforms: Windows");
    }

    let resource_port = resource_port
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_RDP_PORT.to_string());

    if options.disable_gateway {
        let server = ctx.build_server(target, &resource_port, 0).await?;
        return run_with_client(server, &RdpLauncher::default()).await;
    }

    let resolved = ctx.resolve(target, &resource_port).await?;
    resolved.gateway.ensure_tunneling_supported()?;
    let token = resolved.credential.resolve()?;

    let url = rdpfile::rdpfile_url(&resolved.gateway, &resolved.target, options.enable_mfa);
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let body = rdpfile::fetch(&client, &url, token.secret()).await?;

    let dir = std::env::current_dir().context("cannot determine the working directory")?;
    let path = rdpfile::write(&dir, &body).await?;
    debug!(path = %path.display(), "wrote rdp file");

    let command = RdpLauncher::default().file_command(&path, options.configure)?;
    let status = command.run().await?;
    if !status.success() {
        warn!(code = ?status.code(), "mstsc exited with failure");
    }
    Ok(())
}
