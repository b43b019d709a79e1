//! Remote selection settings.

use serde::{Deserialize, Serialize};

/// Which commit to expose, and how to fetch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Branch, tag, full ref name or full hex commit id. Empty selects the
    /// remote's default branch.
    pub reference: String,
    /// Ask for `filter blob:none` when the server supports it.
    pub use_filter: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            reference: String::new(),
            use_filter: true,
        }
    }
}

impl RemoteConfig {
    /// Creates a config for `reference`, with filtering enabled.
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Self::default()
        }
    }

    /// Sets whether to request a blob-less pack.
    pub fn with_filter(mut self, use_filter: bool) -> Self {
        self.use_filter = use_filter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RemoteConfig::default();
        assert!(config.reference.is_empty());
        assert!(config.use_filter);
    }

    #[test]
    fn test_partial_yaml() {
        let config: RemoteConfig = serde_yaml::from_str("reference: main\n").unwrap();
        assert_eq!(config, RemoteConfig::new("main"));

        let config: RemoteConfig = serde_yaml::from_str("use_filter: false\n").unwrap();
        assert_eq!(config, RemoteConfig::default().with_filter(false));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RemoteConfig::new("refs/tags/v1").with_filter(false);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<RemoteConfig>(&json).unwrap(), config);
    }
}
