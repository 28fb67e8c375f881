use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Settings read from `--config <file.json>`. Explicit flags win over every field here.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub database: Option<PathBuf>,
    pub request_timeout_ms: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
    pub max_requested_labels: Option<usize>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log: Option<String>,
}

impl CliConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }
}
