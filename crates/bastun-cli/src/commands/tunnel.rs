//! `bastun tunnel`: open a tunnel on a local port and keep it open until
//! Ctrl+C or the optional timeout.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use bastun_relay::LifecycleController;

use super::{cancel_on_interrupt, CommandContext, TargetArgs};

pub async fn run(
    ctx: &CommandContext,
    target: &TargetArgs,
    resource_port: &str,
    port: u16,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let server = ctx.build_server(target, resource_port, port).await?;
    let local_port = server.start_server().await.context("failed to start tunnel")?;

    eprintln!("Opening tunnel on port: {local_port}");
    eprintln!("Tunnel is ready, connect on port {local_port}");
    eprintln!("Ctrl + C to close");

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    // A timeout of 0 means none.
    let timeout = timeout_secs.filter(|&s| s > 0).map(Duration::from_secs);
    let reason = LifecycleController::new(server, cancel.clone())
        .with_timeout(timeout)
        .run()
        .await;
    cancel.cancel();

    info!(?reason, "tunnel closed");
    Ok(())
}
