//! governance-agent daemon
//!
//! Loads the daemon settings and the operating configuration, connects to
//! the ledger gateway and the telemetry service, starts the agent workers
//! and serves the control API.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use governance_agent::agent::{Agent, AgentClients, AgentTimings};
use governance_agent::api::create_router;
use governance_agent::config::{AgentConfig, ConfigError, Settings};
use governance_agent::ledger::gateway::LedgerGateway;
use governance_agent::telemetry::query::PromQlCompiler;
use governance_agent::telemetry::PrometheusClient;

#[derive(Parser)]
#[command(name = "governance-agent")]
#[command(about = "Autonomous DAO governance agent")]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, default_value = "governance-agent.toml")]
    config: String,

    /// Agent identity (overrides settings file)
    #[arg(long, env = "NODE_NAME")]
    device_name: Option<String>,

    /// Operating configuration, YAML or JSON (overrides settings file)
    #[arg(long, env = "AGENT_CONFIG")]
    operating_config: Option<PathBuf>,

    /// Ledger gateway URL (overrides settings file)
    #[arg(long, env = "LEDGER_GATEWAY_URL")]
    gateway_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("governance_agent=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting governance-agent");
    info!("Settings file: {}", cli.config);

    let mut settings = if Path::new(&cli.config).exists() {
        Settings::load(&cli.config)?
    } else {
        info!("Settings file not found, using defaults");
        Settings::default()
    };

    // Apply CLI overrides
    if let Some(device_name) = cli.device_name {
        settings.node.device_name = Some(device_name);
    }
    if let Some(path) = cli.operating_config {
        settings.node.operating_config = Some(path);
    }
    if let Some(url) = cli.gateway_url {
        settings.ledger.gateway_url = url;
    }

    let device_name = settings.device_name();
    info!("Device name: {}", device_name);

    // Without an operating configuration there is nothing to do
    let config_path = settings
        .node
        .operating_config
        .clone()
        .ok_or(ConfigError::MissingOperatingConfig)?;
    let operating_config = AgentConfig::load(&config_path)
        .with_context(|| format!("loading operating configuration {}", config_path.display()))?;
    info!(
        metric_index = %operating_config.metric_index,
        rules = operating_config.rules.len(),
        actions = operating_config.actions_map.len(),
        "Operating configuration loaded"
    );

    let call_timeout = Duration::from_secs(settings.ledger.call_timeout_secs);
    let ledger = Arc::new(
        LedgerGateway::connect(settings.ledger.gateway_url.clone(), call_timeout)
            .await
            .context("connecting to ledger gateway")?,
    );
    info!(gateway = %settings.ledger.gateway_url, "Ledger gateway connected");

    let telemetry = Arc::new(PrometheusClient::new(
        settings.telemetry.query_url.clone(),
        Duration::from_secs(settings.telemetry.timeout_secs),
    ));

    let clients = AgentClients {
        governance: ledger.clone(),
        store: ledger,
        telemetry,
        compiler: Arc::new(PromQlCompiler::new(settings.telemetry.metric_prefix.clone())),
    };

    let agent = Arc::new(Agent::new(
        device_name,
        operating_config,
        clients,
        AgentTimings::from(&settings),
    ));
    agent.start().await?;

    if settings.api.enabled {
        let app = create_router(agent.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.api.http_port));
        info!("Control API listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        info!("Control API is disabled");
        shutdown_signal().await;
    }

    agent.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
