//! In-process hypervisor with a scripted VM pool.
//!
//! Behaves like a small control plane: power transitions, guest tools that
//! come up a few polls after power-on, a real snapshot tree, guest processes
//! that finish after a scripted number of process listings, and a per-VM
//! guest file system. Every call is recorded so tests can assert on the exact
//! sequence of control-plane operations.

use super::{
    GuestProcess, Hypervisor, PowerState, ProgramSpec, SnapshotId, SnapshotNode, SnapshotRequest,
    ToolsStatus, VmId, VmInfo,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use vmci_shared::errors::{VmciError, VmciResult};

/// Guest file system of one VM: absolute path → contents.
pub type GuestFiles = HashMap<String, Vec<u8>>;

/// Side effect run against the guest file system when a program starts.
pub type ProgramHook = Arc<dyn Fn(&mut GuestFiles) + Send + Sync>;

/// How the guest behaves after power-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBehavior {
    /// Tools report ready on the (n+1)th `vm_info` call after power-on.
    ReadyAfterPolls(u32),
    /// Powers on but tools never come up.
    Never,
}

/// How the guest reacts to a graceful shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownBehavior {
    Graceful,
    /// Ignores the request and stays powered on.
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgramOutcome {
    Exit { code: i64, after_polls: u32 },
    LaunchFails,
    NeverExits,
}

/// Scripted behavior for guest programs matching a path (and optionally an
/// argument substring). Unscripted programs exit 0 on the first listing.
#[derive(Clone)]
pub struct ProgramScript {
    program: String,
    args_contain: Option<String>,
    outcome: ProgramOutcome,
    on_start: Option<ProgramHook>,
}

impl ProgramScript {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args_contain: None,
            outcome: ProgramOutcome::Exit {
                code: 0,
                after_polls: 0,
            },
            on_start: None,
        }
    }

    /// Only match invocations whose argument string contains `needle`.
    pub fn args_contain(mut self, needle: impl Into<String>) -> Self {
        self.args_contain = Some(needle.into());
        self
    }

    pub fn exits(mut self, code: i64) -> Self {
        let after_polls = match self.outcome {
            ProgramOutcome::Exit { after_polls, .. } => after_polls,
            _ => 0,
        };
        self.outcome = ProgramOutcome::Exit { code, after_polls };
        self
    }

    /// Report "still running" for the first `polls` listings.
    pub fn after_polls(mut self, polls: u32) -> Self {
        let code = match self.outcome {
            ProgramOutcome::Exit { code, .. } => code,
            _ => 0,
        };
        self.outcome = ProgramOutcome::Exit {
            code,
            after_polls: polls,
        };
        self
    }

    pub fn fails_to_launch(mut self) -> Self {
        self.outcome = ProgramOutcome::LaunchFails;
        self
    }

    pub fn never_exits(mut self) -> Self {
        self.outcome = ProgramOutcome::NeverExits;
        self
    }

    pub fn on_start(mut self, hook: impl Fn(&mut GuestFiles) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    fn matches(&self, spec: &ProgramSpec) -> bool {
        self.program == spec.program_path
            && self
                .args_contain
                .as_ref()
                .is_none_or(|needle| spec.arguments.contains(needle.as_str()))
    }
}

impl fmt::Debug for ProgramScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramScript")
            .field("program", &self.program)
            .field("args_contain", &self.args_contain)
            .field("outcome", &self.outcome)
            .field("on_start", &self.on_start.is_some())
            .finish()
    }
}

/// Operations that can be made to fail on a given VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    PowerOn,
    Revert,
    CreateSnapshot,
    RemoveSnapshot,
    Upload,
    Download,
}

/// A recorded control-plane call. VMs are identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListVms,
    PowerOn(String),
    PowerOff(String),
    ShutdownGuest(String),
    Revert { vm: String, snapshot: String },
    CreateSnapshot { vm: String, name: String },
    RemoveSnapshot { vm: String, name: String },
    StartProgram { vm: String, program: String, args: String },
    Upload { vm: String, path: String },
    Download { vm: String, path: String },
}

/// Description of a VM to add to the pool.
#[derive(Debug, Clone)]
pub struct MemoryVm {
    name: String,
    uuid: String,
    power_state: PowerState,
    boot: BootBehavior,
    shutdown: ShutdownBehavior,
    snapshots: Vec<SnapshotNode>,
    files: GuestFiles,
    scripts: Vec<ProgramScript>,
}

impl MemoryVm {
    /// Powered-off VM whose guest becomes ready on the second readiness poll.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uuid: format!("uuid-{}", name),
            name,
            power_state: PowerState::PoweredOff,
            boot: BootBehavior::ReadyAfterPolls(1),
            shutdown: ShutdownBehavior::Graceful,
            snapshots: Vec::new(),
            files: GuestFiles::new(),
            scripts: Vec::new(),
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn power_state(mut self, state: PowerState) -> Self {
        self.power_state = state;
        self
    }

    pub fn boot(mut self, boot: BootBehavior) -> Self {
        self.boot = boot;
        self
    }

    pub fn shutdown(mut self, shutdown: ShutdownBehavior) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn snapshots(mut self, roots: Vec<SnapshotNode>) -> Self {
        self.snapshots = roots;
        self
    }

    pub fn file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }

    /// Scripts are matched in insertion order; the first match wins.
    pub fn script(mut self, script: ProgramScript) -> Self {
        self.scripts.push(script);
        self
    }
}

#[derive(Debug)]
struct GuestProcessState {
    spec: ProgramSpec,
    polls_left: Option<u32>,
    exit_code: i64,
}

#[derive(Debug)]
struct VmState {
    id: VmId,
    spec: MemoryVm,
    tools_status: ToolsStatus,
    boot_polls_left: Option<u32>,
    current_snapshot: Option<SnapshotId>,
    processes: HashMap<i64, GuestProcessState>,
    faults: HashSet<Fault>,
}

impl VmState {
    fn info(&self) -> VmInfo {
        VmInfo {
            id: self.id.clone(),
            uuid: self.spec.uuid.clone(),
            name: self.spec.name.clone(),
            power_state: self.spec.power_state,
            tools_status: self.tools_status,
        }
    }

    fn check_fault(&self, fault: Fault) -> VmciResult<()> {
        if self.faults.contains(&fault) {
            return Err(VmciError::Hypervisor(format!(
                "injected {:?} fault on {}",
                fault, self.spec.name
            )));
        }
        Ok(())
    }

    fn require_guest(&self) -> VmciResult<()> {
        if self.spec.power_state != PowerState::PoweredOn || !self.tools_status.is_ready() {
            return Err(VmciError::Hypervisor(format!(
                "guest tools not running on {}",
                self.spec.name
            )));
        }
        Ok(())
    }

    fn go_dark(&mut self) {
        self.spec.power_state = PowerState::PoweredOff;
        self.tools_status = ToolsStatus::NotRunning;
        self.boot_polls_left = None;
        self.processes.clear();
    }
}

#[derive(Debug, Default)]
struct PoolState {
    vms: Vec<VmState>,
    calls: Vec<Call>,
    next_pid: i64,
    next_snapshot: u64,
    clock: Option<DateTime<Utc>>,
}

impl PoolState {
    fn vm_mut(&mut self, id: &VmId) -> VmciResult<&mut VmState> {
        self.vms
            .iter_mut()
            .find(|vm| &vm.id == id)
            .ok_or_else(|| VmciError::Hypervisor(format!("no such VM: {}", id)))
    }

    fn vm(&self, id: &VmId) -> VmciResult<&VmState> {
        self.vms
            .iter()
            .find(|vm| &vm.id == id)
            .ok_or_else(|| VmciError::Hypervisor(format!("no such VM: {}", id)))
    }

    /// Strictly increasing creation timestamps, so ordering by time is total.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.clock {
            Some(last) if now <= last => last + ChronoDuration::seconds(1),
            _ => now,
        };
        self.clock = Some(next);
        next
    }
}

/// Scripted, thread-safe, in-process [`Hypervisor`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryHypervisor {
    inner: Arc<Mutex<PoolState>>,
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_vm`](Self::add_vm).
    pub fn with_vm(self, vm: MemoryVm) -> Self {
        self.add_vm(vm);
        self
    }

    /// Append a VM to the inventory and return its handle.
    pub fn add_vm(&self, vm: MemoryVm) -> VmId {
        let mut state = self.inner.lock();
        let id = VmId::new(format!("vm-{}", state.vms.len() + 1));
        let tools_status = if vm.power_state == PowerState::PoweredOn {
            ToolsStatus::Ok
        } else {
            ToolsStatus::NotRunning
        };
        state.vms.push(VmState {
            id: id.clone(),
            spec: vm,
            tools_status,
            boot_polls_left: None,
            current_snapshot: None,
            processes: HashMap::new(),
            faults: HashSet::new(),
        });
        id
    }

    /// Handle of the VM with this display name.
    pub fn id_of(&self, name: &str) -> Option<VmId> {
        let state = self.inner.lock();
        state
            .vms
            .iter()
            .find(|vm| vm.spec.name == name)
            .map(|vm| vm.id.clone())
    }

    /// Force a power state, as another tenant of the pool would.
    pub fn set_power_state(&self, name: &str, power_state: PowerState) {
        let mut state = self.inner.lock();
        if let Some(vm) = state.vms.iter_mut().find(|vm| vm.spec.name == name) {
            if power_state == PowerState::PoweredOn {
                vm.spec.power_state = PowerState::PoweredOn;
                vm.tools_status = ToolsStatus::Ok;
            } else {
                vm.go_dark();
                vm.spec.power_state = power_state;
            }
        }
    }

    pub fn inject_fault(&self, name: &str, fault: Fault) {
        let mut state = self.inner.lock();
        if let Some(vm) = state.vms.iter_mut().find(|vm| vm.spec.name == name) {
            vm.faults.insert(fault);
        }
    }

    pub fn clear_faults(&self, name: &str) {
        let mut state = self.inner.lock();
        if let Some(vm) = state.vms.iter_mut().find(|vm| vm.spec.name == name) {
            vm.faults.clear();
        }
    }

    pub fn power_state(&self, name: &str) -> Option<PowerState> {
        let state = self.inner.lock();
        state
            .vms
            .iter()
            .find(|vm| vm.spec.name == name)
            .map(|vm| vm.spec.power_state)
    }

    /// Snapshot tree of a VM, by name.
    pub fn snapshots_of(&self, name: &str) -> Vec<SnapshotNode> {
        let state = self.inner.lock();
        state
            .vms
            .iter()
            .find(|vm| vm.spec.name == name)
            .map(|vm| vm.spec.snapshots.clone())
            .unwrap_or_default()
    }

    /// Name of the snapshot the VM was last reverted to or created.
    pub fn current_snapshot(&self, name: &str) -> Option<String> {
        let state = self.inner.lock();
        let vm = state.vms.iter().find(|vm| vm.spec.name == name)?;
        let current = vm.current_snapshot.as_ref()?;
        find_node(&vm.spec.snapshots, current).map(|node| node.name.clone())
    }

    pub fn guest_file(&self, name: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.inner.lock();
        state
            .vms
            .iter()
            .find(|vm| vm.spec.name == name)
            .and_then(|vm| vm.spec.files.get(path).cloned())
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    /// Number of recorded calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.inner.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Programs started in the guest of `name`, as `(program, args)`.
    pub fn started_programs(&self, name: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::StartProgram { vm, program, args } if vm == name => {
                    Some((program.clone(), args.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

fn find_node<'a>(nodes: &'a [SnapshotNode], id: &SnapshotId) -> Option<&'a SnapshotNode> {
    for node in nodes {
        if &node.id == id {
            return Some(node);
        }
        if let Some(found) = find_node(&node.children, id) {
            return Some(found);
        }
    }
    None
}

fn find_node_mut<'a>(
    nodes: &'a mut [SnapshotNode],
    id: &SnapshotId,
) -> Option<&'a mut SnapshotNode> {
    for node in nodes {
        if &node.id == id {
            return Some(node);
        }
        if let Some(found) = find_node_mut(&mut node.children, id) {
            return Some(found);
        }
    }
    None
}

/// Detach `id` from the tree. Its children take its place unless
/// `remove_children` is set, in which case the whole subtree goes.
fn remove_node(
    nodes: &mut Vec<SnapshotNode>,
    id: &SnapshotId,
    remove_children: bool,
) -> Option<SnapshotNode> {
    if let Some(pos) = nodes.iter().position(|n| &n.id == id) {
        let mut removed = nodes.remove(pos);
        if !remove_children {
            let children = std::mem::take(&mut removed.children);
            for (offset, child) in children.into_iter().enumerate() {
                nodes.insert(pos + offset, child);
            }
        }
        return Some(removed);
    }
    for node in nodes.iter_mut() {
        if let Some(removed) = remove_node(&mut node.children, id, remove_children) {
            return Some(removed);
        }
    }
    None
}

#[async_trait::async_trait]
impl Hypervisor for InMemoryHypervisor {
    async fn list_vms(&self) -> VmciResult<Vec<VmInfo>> {
        let mut state = self.inner.lock();
        state.calls.push(Call::ListVms);
        Ok(state.vms.iter().map(VmState::info).collect())
    }

    async fn vm_info(&self, vm: &VmId) -> VmciResult<VmInfo> {
        let mut state = self.inner.lock();
        let vm = state.vm_mut(vm)?;
        if vm.spec.power_state == PowerState::PoweredOn && !vm.tools_status.is_ready() {
            match vm.boot_polls_left {
                Some(0) => {
                    vm.tools_status = ToolsStatus::Ok;
                    vm.boot_polls_left = None;
                }
                Some(n) => vm.boot_polls_left = Some(n - 1),
                None => {}
            }
        }
        Ok(vm.info())
    }

    async fn power_on(&self, vm: &VmId) -> VmciResult<()> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        target.check_fault(Fault::PowerOn)?;
        if target.spec.power_state == PowerState::PoweredOn {
            return Err(VmciError::Hypervisor(format!(
                "{} is already powered on",
                target.spec.name
            )));
        }
        target.spec.power_state = PowerState::PoweredOn;
        target.tools_status = ToolsStatus::NotRunning;
        target.boot_polls_left = match target.spec.boot {
            BootBehavior::ReadyAfterPolls(n) => Some(n),
            BootBehavior::Never => None,
        };
        let name = target.spec.name.clone();
        state.calls.push(Call::PowerOn(name));
        Ok(())
    }

    async fn power_off(&self, vm: &VmId) -> VmciResult<()> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        if target.spec.power_state == PowerState::PoweredOff {
            return Err(VmciError::Hypervisor(format!(
                "{} is already powered off",
                target.spec.name
            )));
        }
        target.go_dark();
        let name = target.spec.name.clone();
        state.calls.push(Call::PowerOff(name));
        Ok(())
    }

    async fn shutdown_guest(&self, vm: &VmId) -> VmciResult<()> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        target.require_guest()?;
        if target.spec.shutdown == ShutdownBehavior::Graceful {
            target.go_dark();
        }
        let name = target.spec.name.clone();
        state.calls.push(Call::ShutdownGuest(name));
        Ok(())
    }

    async fn snapshot_tree(&self, vm: &VmId) -> VmciResult<Vec<SnapshotNode>> {
        let state = self.inner.lock();
        Ok(state.vm(vm)?.spec.snapshots.clone())
    }

    async fn revert_to_snapshot(&self, vm: &VmId, snapshot: &SnapshotId) -> VmciResult<()> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        target.check_fault(Fault::Revert)?;
        let name = find_node(&target.spec.snapshots, snapshot)
            .map(|n| n.name.clone())
            .ok_or_else(|| {
                VmciError::Hypervisor(format!(
                    "snapshot {} does not exist on {}",
                    snapshot, target.spec.name
                ))
            })?;
        // Disk-only snapshots restore to a powered-off machine.
        target.go_dark();
        target.current_snapshot = Some(snapshot.clone());
        let vm_name = target.spec.name.clone();
        state.calls.push(Call::Revert {
            vm: vm_name,
            snapshot: name,
        });
        Ok(())
    }

    async fn create_snapshot(
        &self,
        vm: &VmId,
        request: &SnapshotRequest,
    ) -> VmciResult<SnapshotId> {
        let mut state = self.inner.lock();
        state.vm(vm)?.check_fault(Fault::CreateSnapshot)?;
        state.next_snapshot += 1;
        let id = SnapshotId::new(format!("snapshot-{}", state.next_snapshot));
        let created_at = state.tick();

        let target = state.vm_mut(vm)?;
        let node = SnapshotNode {
            id: id.clone(),
            name: request.name.clone(),
            description: request.description.clone(),
            created_at,
            children: Vec::new(),
        };
        // New snapshots hang below the current one, like a real snapshot chain.
        let mut pending = Some(node);
        if let Some(parent_id) = target.current_snapshot.clone()
            && let Some(parent) = find_node_mut(&mut target.spec.snapshots, &parent_id)
        {
            parent.children.extend(pending.take());
        }
        if let Some(node) = pending {
            target.spec.snapshots.push(node);
        }
        target.current_snapshot = Some(id.clone());
        let vm_name = target.spec.name.clone();
        state.calls.push(Call::CreateSnapshot {
            vm: vm_name,
            name: request.name.clone(),
        });
        Ok(id)
    }

    async fn remove_snapshot(
        &self,
        vm: &VmId,
        snapshot: &SnapshotId,
        remove_children: bool,
    ) -> VmciResult<()> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        target.check_fault(Fault::RemoveSnapshot)?;
        let removed = remove_node(&mut target.spec.snapshots, snapshot, remove_children)
            .ok_or_else(|| {
                VmciError::Hypervisor(format!(
                    "snapshot {} does not exist on {}",
                    snapshot, target.spec.name
                ))
            })?;
        if target.current_snapshot.as_ref() == Some(snapshot) {
            target.current_snapshot = None;
        }
        let vm_name = target.spec.name.clone();
        state.calls.push(Call::RemoveSnapshot {
            vm: vm_name,
            name: removed.name,
        });
        Ok(())
    }

    async fn start_program(&self, vm: &VmId, spec: &ProgramSpec) -> VmciResult<i64> {
        let mut state = self.inner.lock();
        state.vm(vm)?.require_guest()?;
        state.next_pid += 1;
        let pid = state.next_pid + 1000;

        let target = state.vm_mut(vm)?;
        let script = target
            .spec
            .scripts
            .iter()
            .find(|s| s.matches(spec))
            .cloned();
        let vm_name = target.spec.name.clone();

        let (outcome, hook) = match script {
            Some(script) => (script.outcome, script.on_start),
            None => (
                ProgramOutcome::Exit {
                    code: 0,
                    after_polls: 0,
                },
                None,
            ),
        };

        let result = match outcome {
            ProgramOutcome::LaunchFails => 0,
            ProgramOutcome::Exit { code, after_polls } => {
                target.processes.insert(
                    pid,
                    GuestProcessState {
                        spec: spec.clone(),
                        polls_left: Some(after_polls),
                        exit_code: code,
                    },
                );
                pid
            }
            ProgramOutcome::NeverExits => {
                target.processes.insert(
                    pid,
                    GuestProcessState {
                        spec: spec.clone(),
                        polls_left: None,
                        exit_code: 0,
                    },
                );
                pid
            }
        };

        if result > 0
            && let Some(hook) = hook
        {
            hook(&mut target.spec.files);
        }

        state.calls.push(Call::StartProgram {
            vm: vm_name,
            program: spec.program_path.clone(),
            args: spec.arguments.clone(),
        });
        Ok(result)
    }

    async fn list_processes(&self, vm: &VmId, pids: &[i64]) -> VmciResult<Vec<GuestProcess>> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        let mut listed = Vec::with_capacity(pids.len());
        for pid in pids {
            let Some(process) = target.processes.get_mut(pid) else {
                continue;
            };
            let exit_code = match process.polls_left {
                Some(0) => Some(process.exit_code),
                Some(n) => {
                    process.polls_left = Some(n - 1);
                    None
                }
                None => None,
            };
            listed.push(GuestProcess {
                pid: *pid,
                name: process.spec.program_path.clone(),
                cmd_line: format!("{} {}", process.spec.program_path, process.spec.arguments),
                exit_code,
            });
        }
        Ok(listed)
    }

    async fn upload_file(&self, vm: &VmId, guest_path: &str, data: Vec<u8>) -> VmciResult<()> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        target.require_guest()?;
        target.check_fault(Fault::Upload)?;
        target.spec.files.insert(guest_path.to_string(), data);
        let vm_name = target.spec.name.clone();
        state.calls.push(Call::Upload {
            vm: vm_name,
            path: guest_path.to_string(),
        });
        Ok(())
    }

    async fn download_file(&self, vm: &VmId, guest_path: &str) -> VmciResult<Vec<u8>> {
        let mut state = self.inner.lock();
        let target = state.vm_mut(vm)?;
        target.require_guest()?;
        target.check_fault(Fault::Download)?;
        let data = target.spec.files.get(guest_path).cloned().ok_or_else(|| {
            VmciError::Transfer(format!(
                "{} does not exist in guest {}",
                guest_path, target.spec.name
            ))
        })?;
        let vm_name = target.spec.name.clone();
        state.calls.push(Call::Download {
            vm: vm_name,
            path: guest_path.to_string(),
        });
        Ok(data)
    }
}
