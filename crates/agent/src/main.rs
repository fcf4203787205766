//! Model Agent
//!
//! Keeps a command channel open to the model server and applies its
//! download and delete commands to the local model directory.

use std::path::{Path, PathBuf};

use agent::config::{default_config_path, Config};
use agent::{logging, Agent, SessionEvent};
use clap::{Parser, Subcommand};

/// Model Agent - command channel client for a remote model server.
#[derive(Parser, Debug)]
#[command(name = "model-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (.toml or .json)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Connect to the server and process commands until interrupted
    Run,

    /// Validate the configuration, create the root directory and print the settings
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let (config, overridden) = load_config(&config_path)?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let _log_guard = logging::init_tracing(level, config.log_dir.as_deref())?;
    for field in overridden {
        tracing::info!(field, "Overriding configuration value from environment");
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            tracing::info!(config = %config_path.display(), "Model agent starting...");
            run(config).await?;
        }
        Commands::Check => {
            config.ensure_root_dir()?;
            println!("# {}", config_path.display());
            print!("{}", config.to_redacted_toml()?);
            println!();
            println!("Configuration OK");
        }
    }

    Ok(())
}

/// Load, override from the environment and validate the configuration.
///
/// Also returns the names of the fields taken from the environment.
fn load_config(path: &Path) -> anyhow::Result<(Config, Vec<&'static str>)> {
    let mut config = Config::load(path)?;
    let overridden = config.apply_env_overrides();
    config.validate()?;
    Ok((config, overridden))
}

/// Run the agent until SIGINT/SIGTERM.
async fn run(config: Config) -> anyhow::Result<()> {
    let mut agent = Agent::new(config)?;
    let mut events = agent.session_events();
    agent.start().await?;

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged(state) => {
                    tracing::debug!(state = ?state, "Command channel state");
                }
                SessionEvent::Acknowledged(id) => {
                    tracing::debug!(correlation_id = %id, "Command acknowledged");
                }
            }
        }
    });

    let handle = agent.shutdown_handle();
    tokio::select! {
        _ = wait_for_shutdown_signal() => handle.request_exit(),
        _ = handle.exit_requested() => {}
    }

    agent.stop().await
}

/// Wait for SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}", e);
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = wait_for_ctrl_c() => {}
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received SIGINT"),
        Err(e) => {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
