//! SSHGate - reach SSH servers behind NAT through a public relay
//!
//! `sshgate relay` runs the public side; `sshgate agent` runs next to the SSH
//! server in the private network and dials out to the relay.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{AgentOverrides, ConfigFile, RelayOverrides};
use sshgate_agent::Agent;
use sshgate_relay::RelayServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// SSHGate - SSH access through NAT via a relay
#[derive(Parser, Debug)]
#[command(name = "sshgate")]
#[command(about = "SSHGate - SSH access through NAT via a relay")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true, env = "SSHGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, or a filter directive)
    #[arg(long, global = true, default_value = "info", env = "SSHGATE_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public relay
    #[command(long_about = r#"
Run the public relay. SSH clients connect to the SSH listener; agents
connect to the control listener and register with the shared secret.

EXAMPLES:
  sshgate relay --auth-token $SECRET
  sshgate relay --ssh-bind 0.0.0.0:2222 --control-bind 0.0.0.0:3000 --auth-token $SECRET
  sshgate relay --config sshgate.yaml

ENVIRONMENT VARIABLES:
  SSHGATE_SSH_BIND       Client listener address
  SSHGATE_CONTROL_BIND   Agent control listener address
  SSHGATE_AUTH_TOKEN     Shared secret agents must present
    "#)]
    Relay(RelayArgs),

    /// Run an agent next to the SSH server
    #[command(long_about = r#"
Run an agent in the private network. It dials out to the relay, registers,
and forwards every relayed session to the local SSH server.

EXAMPLES:
  sshgate agent --relay relay.example.com:3000 --auth-token $SECRET --agent-id office
  sshgate agent --config sshgate.yaml --log-level debug

ENVIRONMENT VARIABLES:
  SSHGATE_RELAY          Relay control endpoint (host:port)
  SSHGATE_AUTH_TOKEN     Shared secret
  SSHGATE_AGENT_ID       Agent identifier
  SSHGATE_BACKEND_HOST   Host of the local SSH server
  SSHGATE_SSH_PORT       Port of the local SSH server
    "#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Client listener address (default 0.0.0.0:22)
    #[arg(long, env = "SSHGATE_SSH_BIND")]
    ssh_bind: Option<SocketAddr>,

    /// Agent control listener address (default 0.0.0.0:3000)
    #[arg(long, env = "SSHGATE_CONTROL_BIND")]
    control_bind: Option<SocketAddr>,

    /// Shared secret agents must present
    #[arg(long, env = "SSHGATE_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Always relay; never attempt a direct path
    #[arg(long)]
    no_direct_path: bool,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Relay control endpoint (e.g., relay.example.com:3000)
    #[arg(long, env = "SSHGATE_RELAY")]
    relay: Option<String>,

    /// Shared secret
    #[arg(long, env = "SSHGATE_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Agent ID (auto-generated if not specified)
    #[arg(long, env = "SSHGATE_AGENT_ID")]
    agent_id: Option<String>,

    /// Host of the local SSH server (default localhost)
    #[arg(long, env = "SSHGATE_BACKEND_HOST")]
    backend_host: Option<String>,

    /// Port of the local SSH server (default 22)
    #[arg(long, env = "SSHGATE_SSH_PORT")]
    ssh_port: Option<u16>,

    /// Maximum reconnection attempts (0 = infinite, default 10)
    #[arg(long)]
    max_reconnect_attempts: Option<usize>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

async fn run_relay(args: RelayArgs, file: ConfigFile) -> Result<()> {
    let overrides = RelayOverrides {
        ssh_bind: args.ssh_bind,
        control_bind: args.control_bind,
        auth_token: args.auth_token,
        no_direct_path: args.no_direct_path,
    };
    let config = config::build_relay_config(overrides, file.relay)
        .context("Failed to build relay configuration")?;

    info!("SSH listener: {}", config.ssh_bind);
    info!("Control listener: {}", config.control_bind);
    info!(
        "Direct path: {}",
        if config.broker.direct_path_enabled { "enabled" } else { "disabled" }
    );

    let bound = RelayServer::new(config)
        .bind()
        .await
        .context("Failed to start relay")?;

    bound
        .serve(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
            }
        })
        .await?;

    info!("Relay stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs, file: ConfigFile) -> Result<()> {
    let overrides = AgentOverrides {
        agent_id: args.agent_id,
        relay: args.relay,
        auth_token: args.auth_token,
        backend_host: args.backend_host,
        ssh_port: args.ssh_port,
        max_reconnect_attempts: args.max_reconnect_attempts,
    };
    let config = config::build_agent_config(overrides, file.agent)
        .context("Failed to build agent configuration")?;

    // Log configuration (but not the auth token)
    info!("Agent ID: {}", config.agent_id);
    info!("Relay: {}", config.relay_addr);
    info!("Backend: {}", config.backend_addr());

    let agent = Agent::new(config);
    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    });

    agent.run().await.context("Agent stopped")?;

    info!("Agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging first
    setup_logging(&cli.log_level)?;

    let file = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    match cli.command {
        Commands::Relay(args) => run_relay(args, file).await,
        Commands::Agent(args) => run_agent(args, file).await,
    }
}
