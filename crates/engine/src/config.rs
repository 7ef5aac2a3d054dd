//! Classifier configuration via `pinstore.toml`
//!
//! Every field has a default, so an empty file (or no file) yields a
//! working configuration. Storage settings live under `[storage]`.

use pinstore_core::{Error, Result};
use pinstore_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "pinstore.toml";

/// Classifier configuration
///
/// # Example
///
/// ```toml
/// class_cache_capacity = 1024
/// bulk_memory_budget = 67108864
/// active_stores = 1
/// scan_batch_size = 256
///
/// [storage]
/// tree_fanout = 64
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Bound on cached class entries
    #[serde(default = "default_class_cache_capacity")]
    pub class_cache_capacity: usize,
    /// Global byte budget for bulk index builds
    #[serde(default = "default_bulk_memory_budget")]
    pub bulk_memory_budget: usize,
    /// Number of stores sharing the bulk budget
    #[serde(default = "default_active_stores")]
    pub active_stores: usize,
    /// Pins loaded per batch during scans
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_class_cache_capacity() -> usize {
    1024
}

fn default_bulk_memory_budget() -> usize {
    64 * 1024 * 1024
}

fn default_active_stores() -> usize {
    1
}

fn default_scan_batch_size() -> usize {
    256
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            class_cache_capacity: default_class_cache_capacity(),
            bulk_memory_budget: default_bulk_memory_budget(),
            active_stores: default_active_stores(),
            scan_batch_size: default_scan_batch_size(),
            storage: StorageConfig::default(),
        }
    }
}

impl ClassifierConfig {
    /// Byte budget available to one store's bulk build
    pub fn per_store_budget(&self) -> usize {
        self.bulk_memory_budget / self.active_stores.max(1)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first out-of-range field.
    pub fn validate(&self) -> Result<()> {
        if self.class_cache_capacity == 0 {
            return Err(Error::Config("class_cache_capacity must be at least 1".into()));
        }
        if self.active_stores == 0 {
            return Err(Error::Config("active_stores must be at least 1".into()));
        }
        if self.scan_batch_size == 0 {
            return Err(Error::Config("scan_batch_size must be at least 1".into()));
        }
        if self.storage.tree_fanout < 2 {
            return Err(Error::Config("storage.tree_fanout must be at least 2".into()));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# pinstore classifier configuration
#
# Number of class definitions kept decoded in memory (default: 1024).
# Classes still referenced by a caller are never evicted.
class_cache_capacity = 1024

# Byte budget for bulk index builds (default: 64 MiB).
# Exceeding it flushes every pending class buffer to its index.
bulk_memory_budget = 67108864

# Stores sharing the budget; each gets bulk_memory_budget / active_stores.
active_stores = 1

# Pins loaded per batch while scanning (default: 256).
scan_batch_size = 256

[storage]
# Entries per tree level; controls when index roots grow and shrink.
tree_fanout = 64
# max_pages = 1048576
"#
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClassifierConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }
}
