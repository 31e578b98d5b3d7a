use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use predio::commands;
use predio::config::Config;

#[derive(Parser)]
#[command(
    name = "predio",
    version,
    about = "Scrape-task scheduling and orchestration for property listing sites",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration loop until all due tasks drain
    Run {
        /// Site catalog (TOML) to import before scheduling
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Keep running and re-admit tasks as they become due
        #[arg(long, default_value = "false")]
        watch: bool,

        /// Override the configured lane count
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Show registry counts, in-flight tasks and host resources
    Status,

    /// Detect and repair state left by an unclean shutdown
    Recover {
        /// Only report what would be repaired
        #[arg(long, default_value = "false")]
        detect_only: bool,
    },

    /// Import a site catalog into the registry
    Import {
        /// Catalog file (TOML)
        catalog: PathBuf,
    },

    /// Inspect the current checkpoint
    Checkpoint {
        /// List timestamped history documents
        #[arg(long, default_value = "false")]
        history: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;

    tracing::info!("predio orchestrator starting");

    match cli.command {
        Commands::Run {
            catalog,
            watch,
            max_concurrent,
        } => {
            if let Some(lanes) = max_concurrent {
                config.orchestrator.max_concurrent_sites = lanes;
                config.validate()?;
            }
            tracing::info!(
                catalog = ?catalog,
                watch = %watch,
                lanes = config.orchestrator.max_concurrent_sites,
                "Starting run command"
            );
            let exit_code = commands::run(config, catalog, watch).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }

        Commands::Status => {
            commands::status(&config)?;
        }

        Commands::Recover { detect_only } => {
            tracing::info!(detect_only = %detect_only, "Starting recover command");
            commands::recover(&config, detect_only)?;
        }

        Commands::Import { catalog } => {
            tracing::info!(catalog = %catalog.display(), "Starting import command");
            commands::import(&config, &catalog)?;
        }

        Commands::Checkpoint { history } => {
            commands::checkpoint(&config, history)?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("predio=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("predio=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
