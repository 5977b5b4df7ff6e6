use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about = "Sandbox validation, infrastructure lifecycle and deployment for generated apps")]
pub struct Cli {
    /// Path to shipyard.toml (defaults to .shipyard/shipyard.toml)
    #[arg(long, global = true, env = "SHIPYARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP polling API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Enable permissive CORS for local frontend development
        #[arg(long)]
        dev: bool,
    },
    /// Inspect and manage per-project infrastructure
    Infra {
        #[command(subcommand)]
        command: InfraCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum InfraCommands {
    /// Show state locations and tracked resources (no Terraform invocation)
    Status { project: String },
    /// Destroy everything any state location still tracks
    Destroy { project: String },
    /// Destroy leftovers, then apply the given Terraform source
    Provision {
        project: String,
        #[arg(long)]
        source: PathBuf,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            shipyard::config::ShipyardConfig::default_path(&cwd)
        }
    };
    let config = shipyard::config::ShipyardConfig::load_with_env(&config_path)?;
    let _log_guard = cmd::init_tracing(cli.log_format, &config)?;

    match &cli.command {
        Commands::Serve { host, port, dev } => {
            cmd::cmd_serve(config, host.clone(), *port, *dev).await?;
        }
        Commands::Infra { command } => cmd::cmd_infra(&config, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&config_path, &config, command.clone())?,
    }

    Ok(())
}
