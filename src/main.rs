use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use zeule::config::DEFAULT_CONFIG_FILE;

mod cmd;

#[derive(Parser)]
#[command(name = "zeule")]
#[command(version, about = "Content pipeline orchestrator with approval-gated phases")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "ZEULE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator and its HTTP/WebSocket gateway
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Keep pipelines in memory only
        #[arg(long)]
        memory: bool,

        /// Enable dev mode (CORS permissive for a local dashboard)
        #[arg(long)]
        dev: bool,
    },
    /// Print the resolved phase catalog
    Phases,
    /// View or scaffold configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default zeule.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default_filter = if verbose {
        "zeule=debug,tower_http=debug,info"
    } else {
        "zeule=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            memory,
            dev,
        } => {
            cmd::cmd_serve(
                &cli.config,
                cmd::ServeArgs {
                    port,
                    host,
                    db_path,
                    memory,
                    dev,
                },
            )
            .await?;
        }
        Commands::Phases => cmd::cmd_phases(&cli.config)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, command)?,
    }

    Ok(())
}
