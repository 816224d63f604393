//! hatch-agent: keeps a reverse tunnel from this device to a hatch gateway.

use anyhow::Context;
use clap::Parser;
use hatch_agent::config::{expand_tilde_str, CliOverrides};
use hatch_agent::credential::generate_key;
use hatch_agent::{Agent, AgentConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// hatch-agent: device side of a hatch reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "hatch-agent", version, about = "Dials a hatch gateway and serves sessions for this device")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.hatch/agent.toml")]
    config: String,

    /// Device ID to register as
    #[arg(long)]
    device_id: Option<String>,

    /// Gateway agent listener (host:port)
    #[arg(long)]
    gateway: Option<String>,

    /// Hex enrollment token
    #[arg(long)]
    token: Option<String>,

    /// Ed25519 device key file
    #[arg(long)]
    key_file: Option<String>,

    /// Dial the gateway over TLS
    #[arg(long)]
    tls: bool,

    /// CA certificate (PEM) for the gateway
    #[arg(long)]
    ca_cert: Option<String>,

    /// Accept any gateway certificate (development only)
    #[arg(long)]
    insecure: bool,

    /// Generate a device key at --key-file, print its public key and exit
    #[arg(long)]
    keygen: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if cli.keygen {
        let path = expand_tilde_str(cli.key_file.as_deref().unwrap_or("~/.hatch/device.key"));
        let public_key = generate_key(&path).context("failed to generate device key")?;
        println!("wrote {}", path.display());
        println!("public key: {public_key}");
        return Ok(());
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting hatch-agent");

    let config_path = PathBuf::from(&cli.config);
    let config = AgentConfig::load(
        Some(&config_path),
        CliOverrides {
            device_id: cli.device_id.clone(),
            gateway: cli.gateway.clone(),
            token: cli.token.clone(),
            key_file: cli.key_file.clone(),
            tls: cli.tls,
            ca_cert: cli.ca_cert.clone(),
            insecure: cli.insecure,
        },
    )
    .context("failed to load config")?;

    let agent = Arc::new(Agent::from_config(&config).context("failed to create agent")?);
    info!(device_id = %agent.device_id(), gateway = %config.gateway, "agent ready");

    tokio::select! {
        result = agent.run() => {
            result.context("agent stopped")?;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            agent.shutdown();
        }
    }

    info!("hatch-agent stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
