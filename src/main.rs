mod activity;
mod agent;
mod config;
mod control;
mod engine;
#[cfg(test)]
mod fakes;
mod geodata;
mod host;
mod keys;
mod logging;
mod model;
mod periodic;
mod reconcile;
mod resolver;
mod state;
mod traffic;
mod xray;

use agent::Agent;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{load_config, AgentConfig, DEFAULT_CONFIG_PATH};
use control::ControlClient;
use geodata::GeoAssets;
use logging::LogFormat;
use resolver::{resolve, LocalSettings};
use std::path::PathBuf;
use std::sync::Arc;
use xray::XrayEngine;

#[derive(Parser, Debug)]
#[command(name = "fleetnode-agent", version, about = "Proxy node agent")]
struct Args {
    #[arg(long, env = "FLEETNODE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent until SIGINT or SIGTERM.
    Run,
    /// Load or create the reality keypair and print the public key.
    Keygen {
        #[arg(long, value_name = "PATH")]
        key_file: Option<PathBuf>,
    },
    /// Resolve the runtime configuration and print it.
    ShowConfig {
        /// Print the rendered engine configuration instead.
        #[arg(long)]
        engine: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.as_ref().unwrap_or(&Command::Run) {
        Command::Run => {
            let config = load_config(&args.config)?;
            init_logging(&args, Some(&config))?;
            run_agent(config).await
        }
        Command::Keygen { key_file } => {
            let key_path = match key_file {
                Some(path) => {
                    init_logging(&args, None)?;
                    path.clone()
                }
                None => {
                    let config = load_config(&args.config)?;
                    init_logging(&args, Some(&config))?;
                    config.files.reality_key_path()
                }
            };
            let loaded = keys::load_or_create(&key_path)?;
            if loaded.is_new {
                eprintln!("generated new keypair at {}", key_path.display());
            }
            println!("{}", loaded.keys.public_key);
            Ok(())
        }
        Command::ShowConfig { engine } => {
            let config = load_config(&args.config)?;
            init_logging(&args, Some(&config))?;
            show_config(&config, *engine).await
        }
    }
}

fn init_logging(args: &Args, config: Option<&AgentConfig>) -> Result<()> {
    let level = args
        .log_level
        .clone()
        .or_else(|| config.map(|config| config.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = config
        .map(|config| LogFormat::parse(&config.logging.format))
        .unwrap_or(LogFormat::Text);
    logging::init(&level, format)
}

fn controller_for(config: &AgentConfig) -> Result<ControlClient> {
    ControlClient::new(
        &config.controller.url,
        &config.controller.api_key,
        config.controller_timeout(),
        config.controller.tls_pin.clone(),
    )
    .context("failed to build controller client")
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    tracing::info!(
        node_id = config.node.id,
        node_name = %config.node.name,
        controller = %config.controller.url,
        "starting fleetnode-agent"
    );
    let controller = Arc::new(controller_for(&config)?);
    let engine = Arc::new(XrayEngine::from_config(&config));
    let geo = GeoAssets::from_config(&config)?;

    let mut agent = Agent::new(config, controller, engine).with_geo_assets(geo);
    agent.run_until(wait_for_shutdown_signal()).await
}

async fn show_config(config: &AgentConfig, engine: bool) -> Result<()> {
    let controller = controller_for(config)?;
    let keys = keys::load_existing(&config.files.reality_key_path());
    let local = LocalSettings::from_config(config);
    let runtime = resolve(&controller, &local, keys.as_ref())
        .await
        .context("invalid runtime configuration")?;
    let rendered = if engine {
        serde_json::to_string_pretty(&xray::render_config(&runtime))?
    } else {
        serde_json::to_string_pretty(&runtime)?
    };
    println!("{}", rendered);
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            return;
        }
    }

    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_defaults_to_run() {
        let args = Args::try_parse_from(["fleetnode-agent", "--config", "/etc/fleetnode/agent.yaml"]).unwrap();
        assert!(args.command.is_none());
        assert_eq!(args.config, PathBuf::from("/etc/fleetnode/agent.yaml"));
    }

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from(["fleetnode-agent", "keygen", "--key-file", "/tmp/k"]).unwrap();
        match args.command {
            Some(Command::Keygen { key_file }) => assert_eq!(key_file, Some(PathBuf::from("/tmp/k"))),
            other => panic!("unexpected command {:?}", other),
        }

        let args = Args::try_parse_from(["fleetnode-agent", "--log-level", "debug", "show-config", "--engine"]).unwrap();
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(matches!(args.command, Some(Command::ShowConfig { engine: true })));
    }
}
