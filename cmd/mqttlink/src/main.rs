//! mqttlink CLI - publish to and subscribe from an MQTT 3.1.1 broker.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{PubCommand, SubCommand};

/// mqttlink CLI - a small MQTT 3.1.1 client for poking at brokers.
///
/// Connection settings come from flags, or from a YAML file passed with
/// --config (flags given explicitly override the file).
#[derive(Parser)]
#[command(name = "mqttlink")]
#[command(about = "MQTT 3.1.1 publish/subscribe tool")]
#[command(version)]
pub struct Cli {
    /// Client config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Broker host
    #[arg(short = 'H', long, global = true)]
    pub host: Option<String>,

    /// Broker port
    #[arg(short = 'p', long, global = true)]
    pub port: Option<u16>,

    /// Client ID (generated if absent)
    #[arg(short = 'i', long = "id", global = true)]
    pub client_id: Option<String>,

    /// Username
    #[arg(short = 'u', long, global = true)]
    pub username: Option<String>,

    /// Password
    #[arg(short = 'P', long, global = true)]
    pub password: Option<String>,

    /// Keep alive in seconds
    #[arg(short = 'k', long, global = true)]
    pub keep_alive: Option<u16>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish a message
    Pub(PubCommand),
    /// Subscribe and print incoming messages
    Sub(SubCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Pub(cmd) => cmd.run(&cli).await,
        Commands::Sub(cmd) => cmd.run(&cli).await,
    }
}
