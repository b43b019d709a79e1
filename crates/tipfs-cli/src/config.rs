//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tipfs_tree::RemoteConfig;

/// Settings read from a YAML file. Command-line flags take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repository URL, e.g. `https://example.com/org/repo.git`.
    pub url: Option<String>,
    /// Branch, tag, ref name or commit id. Empty selects the default branch.
    pub reference: String,
    /// Request blob-less packs when the server supports them.
    pub use_filter: bool,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Connect timeout in seconds.
    pub timeout_secs: u64,
    /// Log output format: `pretty` or `json`.
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            reference: String::new(),
            use_filter: true,
            user_agent: format!("tipfs/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Loads `path`, or returns defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// The tree settings.
    pub fn remote(&self) -> RemoteConfig {
        RemoteConfig::new(self.reference.clone()).with_filter(self.use_filter)
    }
}
