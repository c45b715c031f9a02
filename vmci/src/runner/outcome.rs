use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::PathBuf;
use vmci_shared::errors::VmciError;

/// Result of a finished CI run.
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub vm: String,
    pub snapshot: String,
    pub commit: String,
    pub reason: String,
    pub log_file: String,
    /// Local copy of the guest log.
    pub report_path: PathBuf,
    pub started_at: DateTime<Local>,
    /// When the guest watchdog would have powered the VM off.
    pub deadline: DateTime<Local>,
}

/// A VM whose known-good snapshot was refreshed.
#[derive(Clone, Debug, Serialize)]
pub struct SavedSnapshot {
    pub vm: String,
    pub snapshot: String,
    pub pruned: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SaveFailure {
    pub vm: String,
    pub kind: &'static str,
    pub error: String,
}

impl SaveFailure {
    pub fn new(vm: &str, error: &VmciError) -> Self {
        Self {
            vm: vm.to_string(),
            kind: error.kind(),
            error: error.to_string(),
        }
    }
}

/// Per-VM results of a save pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SaveReport {
    pub saved: Vec<SavedSnapshot>,
    pub failed: Vec<SaveFailure>,
    /// Matching VMs leased by another runner, or not reached before cancellation.
    pub skipped: Vec<String>,
}

impl SaveReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What [`Runner::execute`](super::Runner::execute) produced.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunReport {
    Ci(RunOutcome),
    Save(SaveReport),
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        match self {
            RunReport::Ci(_) => true,
            RunReport::Save(report) => report.is_success(),
        }
    }
}
