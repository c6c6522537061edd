#![forbid(unsafe_code)]

//! Store configuration.

use serde::{Deserialize, Serialize};

/// Key the tree is persisted under unless configured otherwise.
pub const DEFAULT_STORAGE_KEY: &str = "global";

/// Configuration for a [`Store`](crate::Store).
///
/// Can be embedded in a settings file; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key of the persisted document in durable storage.
    pub storage_key: String,
    /// Maximum nesting depth of the tree, counted from the root object.
    pub max_depth: usize,
    /// Persist after each effective write made outside a batch.
    pub persist_on_write: bool,
    /// Identity map size at which dead wrappers are first pruned.
    pub cache_prune_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_owned(),
            max_depth: 64,
            persist_on_write: true,
            cache_prune_threshold: 256,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    #[must_use]
    pub fn with_persist_on_write(mut self, enabled: bool) -> Self {
        self.persist_on_write = enabled;
        self
    }

    #[must_use]
    pub fn with_cache_prune_threshold(mut self, threshold: usize) -> Self {
        self.cache_prune_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.storage_key, "global");
        assert_eq!(config.max_depth, 64);
        assert!(config.persist_on_write);
    }

    #[test]
    fn builder_chains() {
        let config = StoreConfig::default()
            .with_storage_key("chat_ui_state")
            .with_max_depth(8)
            .with_persist_on_write(false)
            .with_cache_prune_threshold(16);
        assert_eq!(config.storage_key, "chat_ui_state");
        assert_eq!(config.max_depth, 8);
        assert!(!config.persist_on_write);
        assert_eq!(config.cache_prune_threshold, 16);
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"max_depth": 12}"#).unwrap();
        assert_eq!(config.max_depth, 12);
        assert_eq!(config.storage_key, DEFAULT_STORAGE_KEY);
        assert!(config.persist_on_write);
    }
}
