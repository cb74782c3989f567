//! Recovery configuration and engine open options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Version cap that keeps every version of every key during diagnosis.
pub const KEEP_ALL_VERSIONS: u32 = i32::MAX as u32;

/// Location and retention settings of the store being repaired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the table segments and the manifest.
    pub dir: PathBuf,
    /// Directory holding the value log; defaults to `dir`.
    #[serde(default)]
    pub value_dir: Option<PathBuf>,
    /// Explicit number of versions to keep. Setting it opens the store read-only.
    #[serde(default)]
    pub num_versions: Option<u32>,
}

impl StoreConfig {
    /// Creates a store config for a directory that holds both tables and value log.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            value_dir: None,
            num_versions: None,
        }
    }

    /// Sets a separate value-log directory.
    pub fn with_value_dir(mut self, value_dir: impl Into<PathBuf>) -> Self {
        self.value_dir = Some(value_dir.into());
        self
    }

    /// Caps the number of versions kept when opening.
    pub fn with_num_versions(mut self, num_versions: u32) -> Self {
        self.num_versions = Some(num_versions);
        self
    }

    /// Value-log directory, falling back to the table directory.
    pub fn value_dir(&self) -> &Path {
        self.value_dir.as_deref().unwrap_or(&self.dir)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("/var/lib/tablefix/data")
    }
}

/// Caller-supplied settings for one recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RecoveryConfig {
    /// Store to probe and repair.
    #[serde(default)]
    pub store: StoreConfig,
    /// Where to put the backup; generated next to the store when unset.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Repair even when the corrupted segment holds non-zero bytes.
    #[serde(default)]
    pub force_delete_non_empty: bool,
}

impl RecoveryConfig {
    /// Creates a config for the given store with default recovery settings.
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            backup_dir: None,
            force_delete_non_empty: false,
        }
    }

    /// Uses a fixed backup directory instead of a generated one.
    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(backup_dir.into());
        self
    }

    /// Allows deleting corrupted segments that are not all zeros.
    pub fn with_force_delete_non_empty(mut self, force: bool) -> Self {
        self.force_delete_non_empty = force;
        self
    }

    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: RecoveryConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: RecoveryConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}

/// Options handed to [`crate::engine::StoreEngine::open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    /// Table directory.
    pub dir: PathBuf,
    /// Value-log directory.
    pub value_dir: PathBuf,
    /// Maximum number of versions retained per key.
    pub num_versions_to_keep: u32,
    /// Open without taking write ownership of the store.
    pub read_only: bool,
    /// Drop segments that fail their checksum from the manifest during open.
    pub delete_corrupted_segments: bool,
}

impl OpenOptions {
    /// Options for the diagnostic open: no pruning, nothing deleted.
    pub fn probe(store: &StoreConfig) -> Self {
        let (num_versions_to_keep, read_only) = match store.num_versions {
            Some(n) if n > 0 => (n, true),
            _ => (KEEP_ALL_VERSIONS, false),
        };
        Self {
            dir: store.dir.clone(),
            value_dir: store.value_dir().to_path_buf(),
            num_versions_to_keep,
            read_only,
            delete_corrupted_segments: false,
        }
    }

    /// Options for the destructive open that rewrites the manifest.
    pub fn repair(store: &StoreConfig) -> Self {
        Self {
            delete_corrupted_segments: true,
            ..Self::probe(store)
        }
    }
}
