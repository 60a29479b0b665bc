//! Trichter API server
//!
//! Records measurement runs and pushes run changes to live clients over
//! WebSocket and Server-Sent Events.

mod api;
mod config;
mod error;
mod events;
mod hub;
mod models;
mod notifier;
mod storage;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "trichter")]
#[command(about = "Record measurement runs and stream run changes to live clients")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Serve {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,

        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,

        /// Initialize default configuration file
        #[arg(short, long)]
        init: bool,
    },

    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.http_port = port;
            }

            init_logging(&config.log_level, cli.verbose, cli.debug);
            serve(config).await?;
        }
        Commands::Config { show, init } => {
            init_logging("warn", cli.verbose, cli.debug);
            manage_config(show, init)?;
        }
        Commands::Version => {
            println!("trichter v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

/// Setup logging. `RUST_LOG` wins over flags, flags win over the config.
fn init_logging(config_level: &str, verbose: bool, debug: bool) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        config_level
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Explicit path, else the default config file if present, else defaults.
fn load_config(path: Option<&str>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => {
            let default_path = Config::default_path();
            if default_path.exists() {
                Config::load(&default_path.to_string_lossy())?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env();
    Ok(config)
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting trichter v{}", env!("CARGO_PKG_VERSION"));

    config.ensure_dirs()?;
    let storage = storage::Storage::new(&config.db_path).await?;
    storage.initialize().await?;
    info!("Database ready at {:?}", config.db_path);

    api::run_web_server(config, storage).await?;

    info!("Server stopped");
    Ok(())
}

fn manage_config(show: bool, init: bool) -> Result<()> {
    let path = Config::default_path();

    if init {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Config::default().save(&path.to_string_lossy())?;
        println!("Wrote default configuration to {}", path.display());
    }

    if show || !init {
        let config = load_config(None)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
    }

    Ok(())
}
