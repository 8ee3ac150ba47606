//! Optional JSON config file with connection defaults
//!
//! CLI flags always win; the config only fills in what the command line
//! left out.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Staged remote root directory.
    pub remote: Option<PathBuf>,
    /// Default project identifier.
    pub project: Option<String>,
    /// Local tree root.
    pub root: Option<PathBuf>,
    /// Directory for timestamped log files.
    pub logs_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&body).with_context(|| format!("parsing config {}", path.display()))
    }
}
