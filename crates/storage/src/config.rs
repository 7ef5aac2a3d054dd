//! Storage configuration

use serde::{Deserialize, Serialize};

/// Storage configuration; lives under `[storage]` in `pinstore.toml`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Entries per tree level; a tree of height `h` holds `tree_fanout^h`
    #[serde(default = "default_tree_fanout")]
    pub tree_fanout: usize,
    /// Upper bound on allocated pages; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

fn default_tree_fanout() -> usize {
    64
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tree_fanout: default_tree_fanout(),
            max_pages: None,
        }
    }
}
