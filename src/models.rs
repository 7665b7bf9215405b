//! Model registry
//!
//! Caches the server's catalog and resident set. Both lists are replaced
//! wholesale on refresh, never patched.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub size_bytes: u64,
}

/// Entry in the resident set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub name: String,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    catalog: Vec<ModelDescriptor>,
    loaded: Vec<LoadedModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn catalog(&self) -> &[ModelDescriptor] {
        &self.catalog
    }

    pub fn loaded(&self) -> &[LoadedModel] {
        &self.loaded
    }

    pub fn replace_catalog(&mut self, models: Vec<ModelDescriptor>) {
        self.catalog = models;
    }

    pub fn replace_loaded(&mut self, models: Vec<LoadedModel>) {
        self.loaded = models;
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|m| m.name == name)
    }

    /// Resolve `/load` input: a 1-based index into the last catalog, or a
    /// literal name. Out-of-range numbers fall through to the name lookup.
    /// An empty catalog accepts any name.
    pub fn resolve(&self, identifier: &str) -> Result<String> {
        let identifier = identifier.trim();

        if let Ok(index) = identifier.parse::<usize>() {
            if (1..=self.catalog.len()).contains(&index) {
                return Ok(self.catalog[index - 1].name.clone());
            }
        }

        if self.catalog.is_empty() || self.catalog.iter().any(|m| m.name == identifier) {
            return Ok(identifier.to_string());
        }

        Err(ChatError::ModelNotFound(identifier.to_string()))
    }

    /// `/models` listing, one numbered line per model
    pub fn catalog_lines(&self, current: Option<&str>) -> Vec<String> {
        self.catalog
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let mut line = format!("{}. {} ({})", i + 1, m.name, format_size(m.size_bytes));
                if current == Some(m.name.as_str()) {
                    line.push_str(" [current]");
                }
                if self.is_loaded(&m.name) {
                    line.push_str(" [loaded]");
                }
                line
            })
            .collect()
    }
}

const SIZE_UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

/// Human size with two decimals in the largest fitting unit (base 1024)
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, SIZE_UNITS[unit])
}
