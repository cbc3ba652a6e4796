use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const CONFIG_FILE: &str = "carebill.toml";

/// Process-level settings. Business settings live in the database.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Where invoice documents are written. Unset means none are kept.
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            database_path: data_dir.join("carebill.db"),
            log_filter: "info".to_string(),
            artifacts_dir: Some(data_dir.join("invoices")),
        }
    }
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "carebill", "Carebill")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

impl AppConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Reads `path` if given, else `carebill.toml` from the platform config
    /// directory. A missing default file means defaults; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match directories::ProjectDirs::from("com", "carebill", "Carebill") {
                Some(dirs) => (dirs.config_dir().join(CONFIG_FILE), false),
                None => return Ok(Self::default()),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content).with_context(|| format!("In {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}
