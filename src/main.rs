use anyhow::Result;
use clap::{Parser, Subcommand};
use pentest_orchestrator::config::PentestConfig;
use pentest_orchestrator::logging;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "pentest")]
#[command(version, about = "AI-assisted pentest orchestrator")]
pub struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to pentest.toml. Defaults to ./pentest.toml when present.
    #[arg(long, global = true, env = "PENTEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path. Overrides store.db_path.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP control API and live event socket
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,
    },
    /// Write a default pentest.toml and create the database
    Init {
        /// Overwrite an existing pentest.toml
        #[arg(long)]
        force: bool,
    },
    /// Create a target and run the full pipeline in the foreground
    Scan {
        /// Target URL or host
        url: String,

        /// Display name for the target (defaults to the host)
        #[arg(short, long)]
        name: Option<String>,

        /// Approve exploit validation without prompting
        #[arg(long)]
        auto_approve: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = PentestConfig::load(cli.config.as_deref())?;
    if let Some(db_path) = &cli.db_path {
        config.store.db_path = db_path.clone();
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let _log_guard = logging::init(&config.logging)?;

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            cmd::cmd_serve(&config).await?;
        }
        Commands::Init { force } => {
            cmd::cmd_init(cli.config.as_deref(), &config, force)?;
        }
        Commands::Scan {
            url,
            name,
            auto_approve,
        } => {
            cmd::cmd_scan(&config, &url, name.as_deref(), auto_approve).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }

    Ok(())
}
