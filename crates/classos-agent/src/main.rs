//! # classos-agent
//!
//! Lab agent binary: keeps the device connected to the broker, heartbeats,
//! logs incoming commands and answers `ping`.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use classos_client::{AgentClient, ClientConfig, ClientError, MessageHandler};
use classos_core::logging::init_subscriber;
use classos_core::{
    CommandRequestPayload, CommandResponsePayload, Envelope, HeartbeatPayload, MessageType,
};
use classos_settings::AgentSettings;
use serde_json::json;

/// classos lab agent.
#[derive(Parser, Debug)]
#[command(name = "classos-agent", about = "Keeps a lab device connected to the classos broker")]
struct Cli {
    /// Settings file (default: `~/.classos/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker upgrade endpoint (overrides settings).
    #[arg(long)]
    server_url: Option<String>,

    /// Device credential, `device_<agentID>` (overrides settings).
    #[arg(long)]
    token: Option<String>,

    /// Log level.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn load_settings(&self) -> Result<AgentSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(classos_settings::settings_path);
        let settings = classos_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        Ok(settings.agent)
    }

    fn apply(&self, agent: &mut AgentSettings) {
        if let Some(url) = &self.server_url {
            agent.server_url.clone_from(url);
        }
        if let Some(token) = &self.token {
            agent.device_token.clone_from(token);
        }
    }
}

/// Logs every command; answers `ping`.
struct CommandHandler;

#[async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(&self, client: &AgentClient, envelope: Envelope) -> Result<(), ClientError> {
        let command: CommandRequestPayload = envelope.decode_payload()?;
        tracing::info!(
            command = %command.command,
            request_id = envelope.request_id.as_deref(),
            params = %command.params,
            "command received"
        );

        let Some(response) = respond(&command) else {
            return Ok(());
        };
        let mut reply = Envelope::new(MessageType::CommandResponse, &response)?;
        reply.request_id = envelope.request_id;
        client.send_envelope(reply).await
    }
}

/// The reply to `command`, if this agent answers it.
fn respond(command: &CommandRequestPayload) -> Option<CommandResponsePayload> {
    (command.command == "ping").then(|| CommandResponsePayload {
        success: true,
        result: Some(json!("pong")),
        error: None,
    })
}

fn heartbeat() -> HeartbeatPayload {
    HeartbeatPayload {
        status: "online".into(),
        username: env_first(&["USER", "USERNAME"]).unwrap_or_default(),
        hostname: env_first(&["HOSTNAME", "COMPUTERNAME"]),
        ..HeartbeatPayload::default()
    }
}

fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = cli.load_settings()?;
    cli.apply(&mut settings);

    init_subscriber(&cli.log_level);

    if settings.device_token.is_empty() {
        bail!("device token is not configured (set agent.deviceToken, CLASSOS_DEVICE_TOKEN or --token)");
    }

    let client = AgentClient::new(ClientConfig::from_settings(&settings)).with_heartbeat(heartbeat);
    client.on(MessageType::CommandRequest, CommandHandler);

    tokio::select! {
        result = client.connect_with_retry() => {
            result.context("Failed to connect to broker")?;
            if let Err(err) = client.send_heartbeat().await {
                tracing::warn!(error = %err, "initial heartbeat failed");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            client.close().await;
            return Ok(());
        }
    }
    tracing::info!(server_url = %settings.server_url, "classos agent running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    client.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
