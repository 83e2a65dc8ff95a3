//! Mazarin gateway
//!
//! This service:
//! - Forwards raw TCP and UDP ports to fixed upstreams
//! - Routes HTTP(S) requests by host to proxies, files, redirects and the portal
//! - Admits clients only while they hold a whitelist entry from the portal

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use mazarin_gateway::auth::{hash_key, Authenticator, KeyFile};
use mazarin_gateway::config::{Config, GatewayFile};
use mazarin_gateway::{logging, Gateway, GatewaySettings};

#[derive(Debug, Parser)]
#[command(name = "mazarin", version, about = "TCP/UDP and HTTP(S) gateway with a whitelist firewall")]
struct Cli {
    /// Gateway file (overrides MAZARIN_CONFIG).
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print a `keys.json` hash for a portal key.
    HashKey { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::HashKey { key }) = cli.command {
        println!("{}", hash_key(&key)?);
        return Ok(());
    }

    let mut config = Config::from_env()?;
    if let Some(path) = cli.config {
        config.config_path = path;
    }
    let file = GatewayFile::load(&config.config_path)?;

    logging::init(&config.log_level, Some(&file.logging))?;

    info!("Starting mazarin gateway");
    info!(
        config_path = %config.config_path.display(),
        proxy_count = file.proxies.len(),
        firewall_enabled = file.firewall.enabled,
        tls_enabled = file.tls.enabled,
        portal_enabled = file.webserver.enable_webserver,
        "Configuration loaded"
    );

    let authenticator: Arc<dyn Authenticator> = if file.webserver.enable_webserver {
        Arc::new(KeyFile::load(&file.webserver.keys_dir).context("Failed to load portal keys")?)
    } else {
        Arc::new(KeyFile::default())
    };

    let settings = GatewaySettings::from_file(&file, &config)?;
    let gateway = match Gateway::start(settings, authenticator).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(reason = e.reason_code(), error = %e, "Gateway failed to start");
            return Err(e.into());
        }
    };

    let root = gateway.shutdown_token();
    tokio::select! {
        signal = wait_for_signal() => {
            signal?;
            info!("Shutdown signal received");
        }
        _ = root.cancelled() => {}
    }

    if !gateway.shutdown(config.shutdown_timeout).await {
        error!(
            timeout_ms = config.shutdown_timeout.as_millis() as u64,
            "Gateway did not stop cleanly"
        );
    }
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
