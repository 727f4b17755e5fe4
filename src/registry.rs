//! Application entity registry.
//!
//! Loads an ordered list of `{AETitle, IPAddr, Port}` records from a JSON
//! file and exposes a title to address lookup. Duplicate titles are not an
//! error: the last record wins. The registry is read-only between reloads;
//! a reload replaces the table atomically and only on a successful parse.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One entry of the application entity configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AeRecord {
    #[serde(rename = "AETitle")]
    pub title: String,
    #[serde(rename = "IPAddr")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

/// Resolved network address of an application entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeAddress {
    pub host: String,
    pub port: u16,
}

/// Registry load errors. Fatal at load time; the previous table (if any)
/// is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read AE config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse AE config: {0}")]
    Parse(String),
}

/// Immutable title to address table.
#[derive(Debug, Clone, Default)]
pub struct AeRegistry {
    entries: HashMap<String, AeAddress>,
}

impl AeRegistry {
    /// Load from a JSON array of AE records. Last duplicate title wins.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::FileRead(path.display().to_string(), e.to_string()))?;
        let records: Vec<AeRecord> =
            serde_json::from_str(&content).map_err(|e| RegistryError::Parse(e.to_string()))?;
        Ok(Self::from_records(records))
    }

    /// Build a table from an ordered record list.
    pub fn from_records(records: Vec<AeRecord>) -> Self {
        let mut entries = HashMap::new();
        for record in records {
            entries.insert(
                record.title,
                AeAddress {
                    host: record.host,
                    port: record.port,
                },
            );
        }
        Self { entries }
    }

    /// Resolve a title. `None` is a routing failure for the caller, not a
    /// crash.
    pub fn lookup(&self, title: &str) -> Option<&AeAddress> {
        self.entries.get(title)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reloadable registry shared across the adapter.
///
/// Lookups are read-mostly; a miss can trigger one reload of the backing
/// file before the caller gives up, matching how peers are often added to
/// the configuration while the adapter is running.
#[derive(Debug)]
pub struct SharedRegistry {
    path: PathBuf,
    inner: RwLock<AeRegistry>,
}

impl SharedRegistry {
    /// Load the registry from `path`. Malformed or missing input is fatal.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let registry = AeRegistry::load(&path)?;
        debug!(
            path = %path.display(),
            entries = registry.len(),
            "AE registry loaded"
        );
        Ok(Self {
            path,
            inner: RwLock::new(registry),
        })
    }

    /// Resolve a title against the current table.
    pub async fn lookup(&self, title: &str) -> Option<AeAddress> {
        self.inner.read().await.lookup(title).cloned()
    }

    /// Resolve a title, reloading the backing file once on a miss.
    pub async fn lookup_or_reload(&self, title: &str) -> Option<AeAddress> {
        if let Some(address) = self.lookup(title).await {
            return Some(address);
        }
        if let Err(e) = self.reload().await {
            warn!(error = %e, "AE registry reload failed, keeping previous table");
        }
        self.lookup(title).await
    }

    /// Re-invoke the loader. The table is swapped only on success.
    pub async fn reload(&self) -> Result<(), RegistryError> {
        let registry = AeRegistry::load(&self.path)?;
        let mut inner = self.inner.write().await;
        *inner = registry;
        debug!(entries = inner.len(), "AE registry reloaded");
        Ok(())
    }
}
