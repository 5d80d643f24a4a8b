//! bastun: open local tunnels to private hosts through a managed gateway.
//!
//! `bastun tunnel` exposes a target port on a local TCP port; `bastun ssh`
//! and `bastun rdp` open a tunnel on an ephemeral port and launch the native
//! client against it.

mod commands;
mod config;
mod credential;
mod gateway;
mod launcher;
mod rdpfile;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use commands::rdp::RdpOptions;
use commands::ssh::{AuthType, SshOptions};
use commands::{CommandContext, TargetArgs};

/// bastun: tunnel client
#[derive(Parser)]
#[command(name = "bastun", version, about = "Open local tunnels to private hosts through a managed gateway")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Access token (defaults to $BASTUN_ACCESS_TOKEN)
    #[arg(long = "access-token", global = true)]
    access_token: Option<String>,

    /// Read the gateway from a JSON document instead of the config file
    #[arg(long = "gateway-file", global = true)]
    gateway_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a tunnel to a target port and keep it open
    Tunnel {
        #[command(flatten)]
        target: TargetArgs,

        /// Port on the target host
        #[arg(long = "resource-port")]
        resource_port: String,

        /// Local port to listen on (0 picks a free port)
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Close the tunnel after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// SSH to the target through a tunnel
    Ssh {
        #[command(flatten)]
        target: TargetArgs,

        /// Authentication type
        #[arg(long = "auth-type", value_enum)]
        auth_type: AuthType,

        /// Login name on the target
        #[arg(long)]
        username: Option<String>,

        /// Private key file (ssh-key auth)
        #[arg(long = "ssh-key")]
        ssh_key: Option<PathBuf>,

        /// SSH certificate file, passed as CertificateFile
        #[arg(long = "ssh-cert")]
        ssh_cert: Option<PathBuf>,

        /// Port on the target host (default 22)
        #[arg(long = "resource-port")]
        resource_port: Option<String>,

        /// Extra arguments passed to ssh after `--`
        #[arg(last = true)]
        ssh_args: Vec<String>,
    },

    /// RDP to the target through the gateway (Windows only)
    Rdp {
        #[command(flatten)]
        target: TargetArgs,

        /// Port on the target host (default 3389)
        #[arg(long = "resource-port")]
        resource_port: Option<String>,

        /// Open a local tunnel instead of using a gateway-generated RDP file
        #[arg(long = "disable-gateway")]
        disable_gateway: bool,

        /// Open the RDP file for editing before connecting
        #[arg(long = "configure")]
        configure: bool,

        /// Ask the gateway for an RDP file with Entra ID authentication
        #[arg(long = "enable-mfa")]
        enable_mfa: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing. RUST_LOG wins over both defaults.
    let default_filter = if cli.verbose {
        "bastun=debug,bastun_cli=debug,bastun_relay=debug,bastun_core=debug"
    } else {
        "bastun=warn,bastun_cli=info,bastun_relay=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("bastun: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    let cfg = config::Config::load(&config_path)?;

    let ctx = CommandContext {
        config: cfg,
        gateway_file: cli.gateway_file,
        access_token: cli.access_token,
    };

    match cli.command {
        Command::Tunnel {
            target,
            resource_port,
            port,
            timeout,
        } => commands::tunnel::run(&ctx, &target, &resource_port, port, timeout).await,
        Command::Ssh {
            target,
            auth_type,
            username,
            ssh_key,
            ssh_cert,
            resource_port,
            ssh_args,
        } => {
            let opts = SshOptions {
                auth_type,
                username,
                ssh_key,
                certificate: ssh_cert,
                ssh_args,
            };
            commands::ssh::run(&ctx, &target, resource_port.as_deref(), &opts).await
        }
        Command::Rdp {
            target,
            resource_port,
            disable_gateway,
            configure,
            enable_mfa,
        } => {
            let options = RdpOptions {
                disable_gateway,
                configure,
                enable_mfa,
            };
            commands::rdp::run(&ctx, &target, resource_port.as_deref(), options).await
        }
    }
}
