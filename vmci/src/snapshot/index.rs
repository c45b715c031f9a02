//! Known-good snapshot index.
//!
//! Maps a VM's uuid to the snapshot every CI run on it starts from. Written
//! by the save pass, read before each revert.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vmci_shared::errors::{VmciError, VmciResult};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Index of known-good snapshots, serialized as JSON.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KnownGoodIndex {
    /// Schema version for future compatibility
    pub version: String,

    /// VM uuid → known-good entry
    pub vms: HashMap<String, KnownGood>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KnownGood {
    pub snapshot: String,

    /// Display name at the time of saving, for humans reading the file.
    #[serde(default)]
    pub vm_name: String,

    pub saved_at: DateTime<Utc>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl Default for KnownGoodIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownGoodIndex {
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            vms: HashMap::new(),
        }
    }

    /// Load the index from `path`.
    ///
    /// Returns an empty index if the file doesn't exist or is corrupted.
    pub fn load(path: &Path) -> VmciResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Known-good index not found, starting empty");
            return Ok(Self::new());
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(index) => {
                    tracing::debug!("Loaded known-good index with {} VMs", index.len());
                    Ok(index)
                }
                Err(e) => {
                    tracing::warn!("Corrupted known-good index, starting empty: {}", e);
                    Ok(Self::new())
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read known-good index, starting empty: {}", e);
                Ok(Self::new())
            }
        }
    }

    /// Write the index to `path`, replacing the previous file atomically.
    pub fn save(&self, path: &Path) -> VmciResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VmciError::Storage(format!("failed to serialize index: {e}")))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VmciError::Storage(format!("failed to create index dir: {e}")))?;
        }

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| VmciError::Storage(format!("failed to write index: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| VmciError::Storage(format!("failed to replace index: {e}")))?;

        tracing::debug!("Saved known-good index with {} VMs", self.vms.len());
        Ok(())
    }

    /// Known-good snapshot name for a VM uuid.
    pub fn get(&self, uuid: &str) -> Option<&str> {
        self.vms.get(uuid).map(|entry| entry.snapshot.as_str())
    }

    pub fn set(&mut self, uuid: impl Into<String>, entry: KnownGood) {
        self.vms.insert(uuid.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
