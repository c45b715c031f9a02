use std::path::{Path, PathBuf};
use vmci_shared::constants::filenames;
use vmci_shared::errors::{VmciError, VmciResult};

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

/// Where vmci keeps its local state:
///
/// ```text
/// ~/.vmci/config.json        runner options
/// ~/.vmci/known_good.json    VM uuid -> known-good snapshot name
/// ~/.vmci/leases.json        VM uuid -> lease record
/// ~/.vmci/leases.lock        flock guarding leases.json
/// ~/.vmci/logs/              orchestrator logs
/// ~/.vmci/reports/           log artifacts pulled from guests
/// ```
#[derive(Clone, Debug)]
pub struct HomeLayout {
    home_dir: PathBuf,
}

impl HomeLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.home_dir.join(filenames::CONFIG)
    }

    pub fn known_good_index(&self) -> PathBuf {
        self.home_dir.join(filenames::KNOWN_GOOD_INDEX)
    }

    pub fn leases_file(&self) -> PathBuf {
        self.home_dir.join(filenames::LEASES)
    }

    pub fn leases_lock(&self) -> PathBuf {
        self.home_dir.join(filenames::LEASES_LOCK)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(filenames::LOGS_DIR)
    }

    /// Default destination of pulled log artifacts.
    pub fn reports_dir(&self) -> PathBuf {
        self.home_dir.join(filenames::REPORTS_DIR)
    }

    /// Create the home, logs and reports directories.
    pub fn prepare(&self) -> VmciResult<()> {
        std::fs::create_dir_all(&self.home_dir)
            .map_err(|e| VmciError::Storage(format!("failed to create home: {e}")))?;

        std::fs::create_dir_all(self.logs_dir())
            .map_err(|e| VmciError::Storage(format!("failed to create logs dir: {e}")))?;

        std::fs::create_dir_all(self.reports_dir())
            .map_err(|e| VmciError::Storage(format!("failed to create reports dir: {e}")))?;

        Ok(())
    }
}
