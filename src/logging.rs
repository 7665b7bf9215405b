//! Tracing subscriber setup
//!
//! The TUI owns the terminal, so interactive runs log to a daily-rolled
//! file under the state dir. One-shot subcommands log to stderr.

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config;

const NOISY_CRATES: &str = ",hyper=warn,reqwest=warn,rustls=warn";

fn env_filter(default_level: &str) -> EnvFilter {
    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    EnvFilter::try_new(format!("{}{}", base, NOISY_CRATES))
        .unwrap_or_else(|_| EnvFilter::new(format!("{}{}", default_level, NOISY_CRATES)))
}

/// Log to `~/.local/state/tokyo-chat/logs/tokyo-chat.log.<date>`
pub fn init_file() -> Result<()> {
    let dir = config::log_dir()?;
    std::fs::create_dir_all(&dir)?;
    let appender = tracing_appender::rolling::daily(&dir, "tokyo-chat.log");

    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;
    Ok(())
}

pub fn init_stderr() -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter("warn"))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
