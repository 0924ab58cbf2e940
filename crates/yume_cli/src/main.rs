use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use yume_core::{ConfigHandle, YumeConfig};

mod logging;
mod runtime;

#[derive(Parser, Debug)]
#[command(name = "yume", author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "YUME_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Dotenv file loaded before environment overrides
    #[arg(long, env = "ENV_FILE", default_value = ".env")]
    env_file: PathBuf,

    /// Directory for bot.log and aichat.log (overrides [logging] dir)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Print console logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Never send proactive messages
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_loaded = dotenv::from_path(&args.env_file).is_ok();

    let mut config = if args.config.exists() {
        YumeConfig::load(&args.config)?
    } else {
        YumeConfig::from_env()
    };
    if let Some(dir) = &args.log_dir {
        config.logging.dir = dir.clone();
    }

    let _log_guard = logging::init(&config.logging.dir, args.json_logs)
        .with_context(|| format!("Failed to set up logging in {}", config.logging.dir.display()))?;

    tracing::info!("Initializing Yume...");
    if env_loaded {
        tracing::info!("Loaded environment from {}", args.env_file.display());
    }
    if !args.config.exists() {
        tracing::info!(
            "Config file {} not found, using defaults and environment",
            args.config.display()
        );
    }
    config.validate().context("Invalid configuration")?;

    let handle = ConfigHandle::new(config, Some(args.config));
    runtime::run(
        handle,
        runtime::Options {
            scheduler: !args.no_scheduler,
        },
    )
    .await
}
