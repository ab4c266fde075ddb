//! # classos-broker
//!
//! Broker binary: loads settings, starts the WebSocket hub and serves until
//! ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use classos_core::logging::init_subscriber_with_format;
use classos_server::{BrokerConfig, BrokerServer};
use classos_settings::{BrokerSettings, ClassosSettings};

/// classos broker.
#[derive(Parser, Debug)]
#[command(name = "classos-broker", about = "Real-time broker between admin consoles and lab agents")]
struct Cli {
    /// Settings file (default: `~/.classos/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// HMAC key for admin tokens (overrides settings).
    #[arg(long)]
    jwt_secret: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<ClassosSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(classos_settings::settings_path);
        classos_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))
    }

    /// Command-line flags win over every settings layer.
    fn apply(&self, broker: &mut BrokerSettings) {
        if let Some(host) = &self.host {
            broker.host.clone_from(host);
        }
        if let Some(port) = self.port {
            broker.port = port;
        }
        if let Some(secret) = &self.jwt_secret {
            broker.jwt_secret.clone_from(secret);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = cli.load_settings()?;
    cli.apply(&mut settings.broker);

    init_subscriber_with_format(&settings.broker.log_level, settings.broker.log_format);

    if settings.broker.jwt_secret.is_empty() {
        bail!("jwt secret is not configured (set broker.jwtSecret, CLASSOS_JWT_SECRET or --jwt-secret)");
    }

    let metrics = classos_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;
    let server = BrokerServer::new(BrokerConfig::from_settings(&settings.broker)).with_metrics(metrics);

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("classos broker listening on ws://{addr}/ws");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(vec![handle], Some(Duration::from_secs(10)))
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}
