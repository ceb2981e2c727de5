use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use corral_agent::config::AgentConfig;
use corral_agent::connector::HttpConnector;
use corral_agent::dispatch::NodeExecutor;
use corral_agent::exec::SystemRunner;
use corral_agent::poll::PollLoop;

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CORRAL_AGENT_CONFIG")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = AgentArgs::parse();

    let config_str = std::fs::read_to_string(&args.config_file)
        .with_context(|| format!("reading {}", args.config_file.display()))?;
    let config: AgentConfig = toml::from_str(&config_str)
        .with_context(|| format!("parsing {}", args.config_file.display()))?;

    event!(Level::INFO, controller = %config.controller.url, "Corral agent starting");

    let connector = Arc::new(
        HttpConnector::new(&config.controller).context("setting up switchboard connection")?,
    );
    let runner = Arc::new(SystemRunner::new(&config.exec));
    let executor = Arc::new(NodeExecutor::new(runner, &config, connector.clone()));
    let poll = PollLoop::new(connector, executor, &config.poll);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            event!(Level::INFO, "Interrupted, stopping after the current job");
            let _ = shutdown_tx.send(true);
        }
    });

    poll.run(shutdown_rx).await;
    Ok(())
}
