//! Video Harvest - telemetry harvesting pipeline runner and backlog tools.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use harvest_config_and_utils::{init_logging, HarvestConfig, Paths};

/// Video harvest command-line interface.
#[derive(Parser)]
#[command(name = "video-harvest")]
#[command(about = "Client telemetry harvesting pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, store, logs). Defaults to ~/.video-harvest
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline fed by a synthetic event stream until Ctrl-C
    Run {
        /// Milliseconds between synthetic events
        #[arg(long, default_value_t = 1000)]
        event_interval_ms: u64,

        /// Share of synthetic events marked live, in percent
        #[arg(long, default_value_t = 25)]
        live_percent: u8,
    },
    /// Show the session flag and durable backlog
    Status,
    /// Delete durable rows older than the given age
    Purge {
        /// Maximum row age in days
        #[arg(long, default_value_t = 7)]
        days: u64,
    },
    /// Deliver the durable backlog once and exit
    Drain,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let mut config = HarvestConfig::load(&paths)?;
    if config.ensure_device_id() {
        config.save(&paths)?;
    }

    let level = cli.log_level.unwrap_or_else(|| config.log_level.clone());
    let foreground = matches!(cli.command, None | Some(Commands::Run { .. }));
    init_logging(&level, Some(&paths.log_file()), foreground)?;

    match cli.command {
        Some(Commands::Run {
            event_interval_ms,
            live_percent,
        }) => {
            app::run_pipeline(config, paths, event_interval_ms, live_percent).await?;
        }
        None => {
            app::run_pipeline(config, paths, 1000, 25).await?;
        }
        Some(Commands::Status) => {
            app::show_status(&paths)?;
        }
        Some(Commands::Purge { days }) => {
            app::purge(&paths, days)?;
        }
        Some(Commands::Drain) => {
            app::drain(config, paths).await?;
        }
    }

    Ok(())
}
