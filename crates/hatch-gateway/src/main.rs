//! hatch-gateway: reverse-tunnel gateway.
//!
//! Devices dial in on the agent listener; users connect on the client
//! listener and are routed to the device, here or on a peer instance.

use anyhow::Context;
use clap::Parser;
use hatch_core::create_device_token;
use hatch_gateway::config::{expand_tilde_str, CliOverrides};
use hatch_gateway::{tls, Gateway, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// hatch-gateway: reverse-tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "hatch-gateway", version, about = "Reverse-tunnel gateway for hatch agents")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.hatch/gateway.toml")]
    config: String,

    /// Instance ID (random when unset)
    #[arg(long)]
    instance_id: Option<String>,

    /// Agent listen address
    #[arg(long)]
    agent_listen: Option<String>,

    /// Client listen address
    #[arg(long)]
    client_listen: Option<String>,

    /// Enable TLS on both listeners
    #[arg(long)]
    tls: bool,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate a self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Redis URL for the shared registry and relay bus
    #[arg(long)]
    redis_url: Option<String>,

    /// Directory for session recordings
    #[arg(long)]
    recording_dir: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Print an enrollment token for this device ID and exit
    #[arg(long, value_name = "DEVICE_ID")]
    issue_token: Option<String>,

    /// Lifetime of tokens printed by --issue-token
    #[arg(long, default_value_t = 30 * 24 * 3600)]
    token_ttl_secs: u64,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting hatch-gateway");

    let (cert, key) = if cli.generate_cert {
        let dir = expand_tilde_str("~/.hatch");
        let (c, k) = tls::generate_self_signed_cert(&dir)
            .context("failed to generate self-signed certificate")?;
        info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
        (
            Some(c.to_string_lossy().into_owned()),
            Some(k.to_string_lossy().into_owned()),
        )
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let config_path = PathBuf::from(&cli.config);
    let config = GatewayConfig::load(
        Some(&config_path),
        CliOverrides {
            instance_id: cli.instance_id.clone(),
            agent_listen: cli.agent_listen.clone(),
            client_listen: cli.client_listen.clone(),
            tls: cli.tls || cli.generate_cert,
            cert,
            key,
            redis_url: cli.redis_url.clone(),
            recording_dir: cli.recording_dir.clone(),
            max_sessions: cli.max_sessions,
        },
    )
    .context("failed to load config")?;

    if let Some(device_id) = &cli.issue_token {
        let secret = config
            .file
            .auth
            .token_secret
            .as_deref()
            .context("auth.token_secret is not set")?;
        let secret = hex::decode(secret.trim()).context("auth.token_secret is not hex")?;
        let token = create_device_token(&secret, device_id, cli.token_ttl_secs);
        println!("{}", hex::encode(token));
        return Ok(());
    }

    let acceptor = match &config.tls {
        Some((cert, key)) => Some(tls::load_acceptor(cert, key).context("failed to load TLS config")?),
        None => None,
    };

    let gateway = Arc::new(Gateway::from_config(&config).context("failed to create gateway")?);
    info!(instance_id = %gateway.instance_id(), "gateway ready");

    tokio::select! {
        result = gateway.clone().run(config.agent_listen, config.client_listen, acceptor) => {
            if let Err(e) = result {
                error!(error = %e, "gateway error");
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    gateway.shutdown().await;
    info!("hatch-gateway stopped");
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
