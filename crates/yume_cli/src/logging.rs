//! Console plus daily-rolling file logs.
//!
//! `bot.log.<date>` gets everything; completion transcripts logged at the
//! `yume::aichat` target also go to `aichat.log.<date>`.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};
use yume_reasoning::providers::AICHAT_TARGET;

const BOT_LOG: &str = "bot.log";
const AICHAT_LOG: &str = "aichat.log";

/// Keeps the background log writers alive. Drop it last.
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

pub fn init(dir: &Path, json: bool) -> anyhow::Result<LogGuard> {
    std::fs::create_dir_all(dir)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if json {
        layers.push(Box::new(fmt::layer().json()));
    } else {
        layers.push(Box::new(fmt::layer()));
    }

    let (bot, bot_guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, BOT_LOG));
    layers.push(Box::new(fmt::layer().with_writer(bot).with_ansi(false)));

    let (aichat, aichat_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, AICHAT_LOG));
    layers.push(Box::new(
        fmt::layer()
            .with_writer(aichat)
            .with_ansi(false)
            .with_target(false)
            .with_filter(filter_fn(|meta| meta.target() == AICHAT_TARGET)),
    ));

    layers.push(Box::new(filter));
    Registry::default().with(layers).try_init()?;

    Ok(LogGuard {
        _guards: vec![bot_guard, aichat_guard],
    })
}
