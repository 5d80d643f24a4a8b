//! `bastun ssh`: open a tunnel on an ephemeral port and run `ssh` through it.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::ValueEnum;

use bastun_core::resource::DEFAULT_SSH_PORT;

use super::{run_with_client, CommandContext, TargetArgs};
use crate::launcher::SshLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AuthType {
    Password,
    SshKey,
    Aad,
}

/// Options for the ssh client.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub auth_type: AuthType,
    pub username: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
    pub ssh_args: Vec<String>,
}

/// Check the auth options and build the launcher, before any tunnel exists.
pub fn build_launcher(opts: &SshOptions) -> Result<SshLauncher> {
    let launcher = match opts.auth_type {
        AuthType::Password => {
            let Some(username) = &opts.username else {
                bail!("Please enter username with --username.");
            };
            SshLauncher::new(username.clone())
        }
        AuthType::SshKey => {
            let (Some(username), Some(key)) = (&opts.username, &opts.ssh_key) else {
                bail!("Please enter username --username and ssh cert location --ssh-key.");
            };
            SshLauncher::new(username.clone()).with_private_key(key.clone())
        }
        AuthType::Aad => {
            bail!(
                "AAD login needs an external certificate helper; obtain a certificate \
                 and use --auth-type ssh-key instead"
            );
        }
    };
    let launcher = match &opts.certificate {
        Some(cert) => launcher.with_certificate(cert.clone()),
        None => launcher,
    };
    Ok(launcher.with_extra_args(opts.ssh_args.clone()))
}

pub async fn run(
    ctx: &CommandContext,
    target: &TargetArgs,
    resource_port: Option<&str>,
    opts: &SshOptions,
) -> Result<()> {
    let launcher = build_launcher(opts)?;
    let resource_port = resource_port
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_SSH_PORT.to_string());

    let server = ctx.build_server(target, &resource_port, 0).await?;
    run_with_client(server, &launcher).await
}
