//! tokyo-chat - chat with local Ollama models from the terminal
//!
//! USAGE:
//!   tokyo-chat [--model <name>] [--pick]   # interactive chat
//!   tokyo-chat models                      # list catalog and loaded models
//!   tokyo-chat doctor                      # check config and server
//!   tokyo-chat config set <key> <value>    # non-interactive config

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use tokyo_chat::client::{ModelBackend, OllamaClient};
use tokyo_chat::config::{self, Config};
use tokyo_chat::models::format_size;
use tokyo_chat::{logging, ui};

// ═══════════════════════════════════════════════════════════════
// CLI
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, PartialEq)]
enum Command {
    Interactive {
        model: Option<String>,
        pick: bool,
    },
    Models,
    Doctor,
    ConfigSet {
        key: String,
        value: String,
    },
    Help,
}

fn parse_args(args: &[String]) -> Command {
    if args.iter().any(|a| a == "--help" || a == "-h") {
        return Command::Help;
    }

    match args.first().map(|s| s.as_str()) {
        Some("doctor") => return Command::Doctor,
        Some("models") => return Command::Models,
        Some("config") if args.get(1).map(|s| s.as_str()) == Some("set") => {
            return Command::ConfigSet {
                key: args.get(2).cloned().unwrap_or_default(),
                value: args.get(3).cloned().unwrap_or_default(),
            };
        }
        _ => {}
    }

    let mut model = None;
    let mut pick = false;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--model" | "-m" => {
                i += 1;
                model = args.get(i).cloned();
            }
            "--pick" | "-p" => pick = true,
            _ => {}
        }
        i += 1;
    }

    Command::Interactive { model, pick }
}

fn print_help() {
    println!(r#"tokyo-chat - terminal chat for a local Ollama server

USAGE:
    tokyo-chat [--model <name>] [--pick]   # interactive chat
    tokyo-chat models                      # list catalog and loaded models
    tokyo-chat doctor                      # check config and server
    tokyo-chat config set <key> <value>    # set config value (host, model, refresh)

FLAGS:
    -m, --model <name>      Load this model on startup
    -p, --pick              Choose a model to load from a searchable list
    -h, --help              Show this help

CONFIG:
    ~/.config/tokyo-chat/config.json       host, default model, refresh interval
    ~/.local/state/tokyo-chat/logs/        log files

ENVIRONMENT:
    OLLAMA_HOST             Override server host (default http://localhost:11434)
    RUST_LOG                Log filter (default info)

CHAT COMMANDS:
    /models  /loaded  /load <n|name>  /clear  /reset  /history  /help

KEYS:
    Enter     Send
    Esc       Stop the streaming reply (quits when idle)
    Ctrl-C    Quit
    Tab       Switch Chat / Models
    PgUp/PgDn Scroll
"#);
}

// ═══════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args) {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Doctor => {
            logging::init_stderr()?;
            run_doctor().await
        }
        Command::Models => {
            logging::init_stderr()?;
            run_models().await
        }
        Command::ConfigSet { key, value } => run_config_set(&key, &value),
        Command::Interactive { model, pick } => {
            if let Err(e) = logging::init_file() {
                eprintln!("Logging disabled: {:#}", e);
            }
            run_interactive(model, pick).await
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════

async fn run_doctor() -> Result<()> {
    println!("tokyo-chat doctor\n");

    let path = config::config_path()?;
    let cfg = Config::load()?;
    println!("[{}] Config: {}", if path.exists() { "✓" } else { "-" }, path.display());
    println!("[✓] Host: {}", cfg.host());

    let client = OllamaClient::new(cfg.api_base());
    match client.check_connectivity().await {
        Ok(version) => println!("[✓] Server: Ollama {}", version),
        Err(e) => {
            println!("[✗] Server: {}", e);
            return Ok(());
        }
    }

    match client.list_models().await {
        Ok(models) => println!("[{}] Models: {} available", if models.is_empty() { "✗" } else { "✓" }, models.len()),
        Err(e) => println!("[✗] Models: {}", e),
    }
    match client.list_loaded().await {
        Ok(loaded) => println!("[✓] In memory: {}", loaded.len()),
        Err(e) => println!("[✗] In memory: {}", e),
    }

    Ok(())
}

async fn run_models() -> Result<()> {
    let cfg = Config::load()?;
    let client = OllamaClient::new(cfg.api_base());

    let models = client
        .list_models()
        .await
        .with_context(|| format!("Failed to list models from {}", cfg.host()))?;
    let loaded = client.list_loaded().await.unwrap_or_else(|e| {
        warn!(error = %e, "could not fetch loaded models");
        Vec::new()
    });

    println!("Models ({}):", models.len());
    for (i, m) in models.iter().enumerate() {
        let mark = if loaded.iter().any(|l| l.name == m.name) { " [loaded]" } else { "" };
        println!("  {:>2}. {} ({}){}", i + 1, m.name, format_size(m.size_bytes), mark);
    }
    if models.is_empty() {
        println!("  (none - pull one with `ollama pull <model>`)");
    }

    Ok(())
}

fn run_config_set(key: &str, value: &str) -> Result<()> {
    let mut cfg = Config::load()?;
    cfg.set(key, value)?;
    cfg.save()?;
    println!("Set {} = {} in {}", key, value, config::config_path()?.display());
    Ok(())
}

async fn run_interactive(model: Option<String>, pick: bool) -> Result<()> {
    let cfg = Config::load()?;
    let client = OllamaClient::new(cfg.api_base());
    info!(host = %cfg.host(), "starting interactive session");

    let mut preload = model.or_else(|| cfg.default_model.clone());

    if pick {
        match client.list_models().await {
            Ok(models) if !models.is_empty() => {
                let loaded = client.list_loaded().await.unwrap_or_else(|e| {
                    warn!(error = %e, "could not fetch loaded models");
                    Vec::new()
                });
                match ui::pick_model(&models, &loaded) {
                    Ok(choice) => preload = Some(choice),
                    Err(e) => info!(error = %e, "picker closed without a choice"),
                }
            }
            Ok(_) => println!("No models available to pick from."),
            Err(e) => println!("Could not fetch models: {}", e),
        }
    }

    let backend: Arc<dyn ModelBackend> = Arc::new(client);
    ui::run_tui(backend, cfg.refresh_interval(), preload).await
}
