//! Hypervisor control interface.
//!
//! vmci never talks to a virtualization product directly. Everything it needs
//! from the control plane (inventory, power, snapshots, guest processes, guest
//! files) goes through the [`Hypervisor`] trait. Backends:
//!
//! - [`memory::InMemoryHypervisor`]: scripted in-process pool, used by tests.
//! - [`http::HttpHypervisor`]: JSON-over-HTTP client (feature `rest`).

#[cfg(feature = "rest")]
pub mod http;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use vmci_shared::errors::VmciResult;

pub use memory::InMemoryHypervisor;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Opaque handle the control plane uses to address a VM.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of a single snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// VM INVENTORY
// ============================================================================

/// Power state as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the guest tools agent, which is what makes guest operations work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolsStatus {
    NotInstalled,
    NotRunning,
    Old,
    Ok,
}

impl ToolsStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ToolsStatus::Ok)
    }
}

/// One entry of the VM inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: VmId,
    /// Stable identity, used as the key for persisted per-VM state.
    pub uuid: String,
    pub name: String,
    pub power_state: PowerState,
    pub tools_status: ToolsStatus,
}

impl VmInfo {
    pub fn is_powered_off(&self) -> bool {
        self.power_state == PowerState::PoweredOff
    }

    /// Powered on with guest tools answering.
    pub fn is_guest_ready(&self) -> bool {
        self.power_state == PowerState::PoweredOn && self.tools_status.is_ready()
    }
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

/// A node of a VM's snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: SnapshotId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

/// Parameters of a snapshot creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
    pub description: String,
    /// Include guest memory. vmci always passes `false`.
    pub memory: bool,
    /// Quiesce the guest file system. vmci always passes `false`.
    pub quiesce: bool,
}

// ============================================================================
// GUEST PROCESSES
// ============================================================================

/// Program to start inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub program_path: String,
    /// Single argument string, passed through to the guest verbatim.
    #[serde(default)]
    pub arguments: String,
}

/// Guest process entry as returned by a process listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestProcess {
    pub pid: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cmd_line: String,
    /// `None` while the process is running. Negative values are treated the same way.
    #[serde(default)]
    pub exit_code: Option<i64>,
}

// ============================================================================
// TRAIT
// ============================================================================

/// Operations vmci consumes from the virtualization control plane.
///
/// Every method is awaitable to completion of the underlying control-plane
/// task, except guest processes: `start_program` returns as soon as the
/// process is launched and completion is only observable via
/// `list_processes`.
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    /// All VMs, in inventory order.
    async fn list_vms(&self) -> VmciResult<Vec<VmInfo>>;

    /// Fresh view of one VM.
    async fn vm_info(&self, vm: &VmId) -> VmciResult<VmInfo>;

    async fn power_on(&self, vm: &VmId) -> VmciResult<()>;

    /// Hard power-off.
    async fn power_off(&self, vm: &VmId) -> VmciResult<()>;

    /// Ask the guest OS to shut down. Returns once the request is delivered.
    async fn shutdown_guest(&self, vm: &VmId) -> VmciResult<()>;

    /// Root snapshots, each carrying its children.
    async fn snapshot_tree(&self, vm: &VmId) -> VmciResult<Vec<SnapshotNode>>;

    async fn revert_to_snapshot(&self, vm: &VmId, snapshot: &SnapshotId) -> VmciResult<()>;

    async fn create_snapshot(
        &self,
        vm: &VmId,
        request: &SnapshotRequest,
    ) -> VmciResult<SnapshotId>;

    async fn remove_snapshot(
        &self,
        vm: &VmId,
        snapshot: &SnapshotId,
        remove_children: bool,
    ) -> VmciResult<()>;

    /// Launch a guest process. A result `<= 0` means the launch failed.
    async fn start_program(&self, vm: &VmId, spec: &ProgramSpec) -> VmciResult<i64>;

    async fn list_processes(&self, vm: &VmId, pids: &[i64]) -> VmciResult<Vec<GuestProcess>>;

    /// Write a file into the guest, replacing any existing file.
    async fn upload_file(&self, vm: &VmId, guest_path: &str, data: Vec<u8>) -> VmciResult<()>;

    /// Read a file out of the guest.
    async fn download_file(&self, vm: &VmId, guest_path: &str) -> VmciResult<Vec<u8>>;
}
