//! Configuration management with XDG paths
//!
//! ~/.config/tokyo-chat/config.json - server host, default model, refresh interval
//! ~/.local/state/tokyo-chat/logs/  - rolling log files

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "tokyo-chat";

pub const DEFAULT_HOST: &str = "http://localhost:11434";
pub const HOST_ENV: &str = "OLLAMA_HOST";

/// Get config directory (~/.config/tokyo-chat/)
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Could not determine config directory")?;
    Ok(base.join(APP_NAME))
}

/// Get state directory (~/.local/state/tokyo-chat/)
pub fn state_dir() -> Result<PathBuf> {
    let base = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .context("Could not determine state directory")?;
    Ok(base.join(APP_NAME))
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join("logs"))
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Ollama server root, without the `/api` suffix
    #[serde(default = "default_host")]
    pub host: String,

    /// Model to warm-load at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Registry refresh interval in seconds
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

fn default_host() -> String { DEFAULT_HOST.to_string() }
fn default_refresh_secs() -> u64 { 10 }

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            default_model: None,
            refresh_secs: default_refresh_secs(),
        }
    }
}

impl Config {
    /// Load config from the default location, or return defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, &content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Server host, `OLLAMA_HOST` taking precedence over the file
    pub fn host(&self) -> String {
        host_with_override(&self.host, std::env::var(HOST_ENV).ok())
    }

    /// Base URL of the REST API, e.g. `http://localhost:11434/api`
    pub fn api_base(&self) -> String {
        format!("{}/api", self.host().trim_end_matches('/'))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs.max(1))
    }

    /// Apply `config set <key> <value>`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "host" => self.host = value.to_string(),
            "model" | "default_model" => {
                self.default_model = if value.is_empty() { None } else { Some(value.to_string()) };
            }
            "refresh" | "refresh_secs" => {
                self.refresh_secs = value
                    .parse()
                    .with_context(|| format!("refresh must be a number of seconds, got '{}'", value))?;
            }
            _ => anyhow::bail!("Unknown config key: {}. Valid keys: host, model, refresh", key),
        }
        Ok(())
    }
}

fn host_with_override(configured: &str, env: Option<String>) -> String {
    let host = match env {
        Some(h) if !h.trim().is_empty() => h.trim().to_string(),
        _ => configured.to_string(),
    };
    // OLLAMA_HOST is commonly given as bare host:port
    if host.starts_with("http://") || host.starts_with("https://") {
        host
    } else {
        format!("http://{}", host)
    }
}
