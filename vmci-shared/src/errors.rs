//! Error taxonomy for vmci.
//!
//! The first five variants are the run-level failures a caller is expected to
//! branch on. None of them is retried by the component that raises it: retry
//! happens in the pool scan loop or is left to whoever re-invokes the runner.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the vmci crates.
pub type VmciResult<T> = Result<T, VmciError>;

#[derive(Debug, Error)]
pub enum VmciError {
    /// The guest refused to start a process (non-positive pid).
    #[error("failed to launch '{program}' in guest: {reason}")]
    Launch { program: String, reason: String },

    /// A guest process finished with a non-zero exit code.
    #[error("'{program}' exited with code {exit_code}")]
    RemoteExecution { program: String, exit_code: i64 },

    /// Guest never reported powered-on and tools-ready within the attempt budget.
    #[error("VM {vm} did not finish booting after {attempts} attempts")]
    BootTimeout { vm: String, attempts: u32 },

    /// Named snapshot is absent from the VM's snapshot tree.
    #[error("could not find snapshot '{snapshot}' for {vm}")]
    SnapshotNotFound { vm: String, snapshot: String },

    /// No matching powered-off VM became available within the scan window.
    #[error("no VM matching version {version} became available within {}s", waited.as_secs())]
    NoResourceAvailable { version: String, waited: Duration },

    /// A blocking guest command outlived its maximum wait.
    #[error("'{program}' still running after {}s", waited.as_secs())]
    CommandTimeout { program: String, waited: Duration },

    /// Work was cancelled through a cancellation token.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Control-plane request failed.
    #[error("hypervisor: {0}")]
    Hypervisor(String),

    /// File transfer to or from the guest failed.
    #[error("transfer: {0}")]
    Transfer(String),

    #[error("config: {0}")]
    Config(String),

    /// Local persistence (index, lease table, reports) failed.
    #[error("storage: {0}")]
    Storage(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl VmciError {
    /// Short machine-readable name, used in JSON reports.
    pub fn kind(&self) -> &'static str {
        match self {
            VmciError::Launch { .. } => "launch_error",
            VmciError::RemoteExecution { .. } => "remote_execution_error",
            VmciError::BootTimeout { .. } => "boot_timeout",
            VmciError::SnapshotNotFound { .. } => "snapshot_not_found",
            VmciError::NoResourceAvailable { .. } => "no_resource_available",
            VmciError::CommandTimeout { .. } => "command_timeout",
            VmciError::Cancelled(_) => "cancelled",
            VmciError::Hypervisor(_) => "hypervisor",
            VmciError::Transfer(_) => "transfer",
            VmciError::Config(_) => "config",
            VmciError::Storage(_) => "storage",
            VmciError::InvalidState(_) => "invalid_state",
            VmciError::InvalidArgument(_) => "invalid_argument",
            VmciError::Internal(_) => "internal",
        }
    }
}
