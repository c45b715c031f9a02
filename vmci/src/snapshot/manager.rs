use super::index::{KnownGood, KnownGoodIndex};
use crate::hypervisor::{Hypervisor, SnapshotId, SnapshotNode, SnapshotRequest, VmInfo};
use chrono::{NaiveDateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use vmci_shared::constants::snapshots;
use vmci_shared::errors::{VmciError, VmciResult};

/// Which snapshots a prune pass keeps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub prefix: String,
    pub keep: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            prefix: snapshots::UPDATE_PREFIX.to_string(),
            keep: snapshots::KEEP,
        }
    }
}

/// First node named `name`, depth-first in pre-order: each root, then its
/// children in order, before the next root.
///
/// Iterative with a visited set, so neither a deep chain nor a control plane
/// that reports a node twice can blow the stack or loop.
pub fn find_in_tree<'a>(roots: &'a [SnapshotNode], name: &str) -> Option<&'a SnapshotNode> {
    let mut visited = HashSet::new();
    let mut stack: Vec<&SnapshotNode> = roots.iter().rev().collect();

    while let Some(node) = stack.pop() {
        if !visited.insert(&node.id) {
            continue;
        }
        if node.name == name {
            return Some(node);
        }
        stack.extend(node.children.iter().rev());
    }
    None
}

/// Every node of the tree, in the same order as [`find_in_tree`] visits them.
pub fn flatten(roots: &[SnapshotNode]) -> Vec<&SnapshotNode> {
    let mut visited = HashSet::new();
    let mut stack: Vec<&SnapshotNode> = roots.iter().rev().collect();
    let mut all = Vec::new();

    while let Some(node) = stack.pop() {
        if !visited.insert(&node.id) {
            continue;
        }
        all.push(node);
        stack.extend(node.children.iter().rev());
    }
    all
}

/// Name and description of a save-pass snapshot taken at `now`.
pub fn timestamped_name(prefix: &str, now: NaiveDateTime) -> (String, String) {
    let name = format!("{}{}", prefix, now.format("%Y%m%d%H%M%S"));
    let description = format!(
        "Snapshot taken at {} after applying updates",
        now.format("%a, %d %B %Y %H:%M:%S")
    );
    (name, description)
}

/// Snapshot lookup, revert, creation and pruning for pool VMs.
#[derive(Clone)]
pub struct SnapshotManager {
    hypervisor: Arc<dyn Hypervisor>,
    index_path: PathBuf,
}

impl SnapshotManager {
    /// `index_path` is the known-good index file.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, index_path: PathBuf) -> Self {
        Self {
            hypervisor,
            index_path,
        }
    }

    pub async fn find_by_name(&self, vm: &VmInfo, name: &str) -> VmciResult<Option<SnapshotNode>> {
        let tree = self.hypervisor.snapshot_tree(&vm.id).await?;
        Ok(find_in_tree(&tree, name).cloned())
    }

    /// Like [`find_by_name`](Self::find_by_name), failing with `SnapshotNotFound`.
    pub async fn require(&self, vm: &VmInfo, name: &str) -> VmciResult<SnapshotNode> {
        self.find_by_name(vm, name)
            .await?
            .ok_or_else(|| VmciError::SnapshotNotFound {
                vm: vm.name.clone(),
                snapshot: name.to_string(),
            })
    }

    pub async fn revert(&self, vm: &VmInfo, snapshot: &SnapshotNode) -> VmciResult<()> {
        tracing::info!(vm = %vm.name, snapshot = %snapshot.name, "Reverting to snapshot");
        self.hypervisor
            .revert_to_snapshot(&vm.id, &snapshot.id)
            .await
    }

    /// Find `name` anywhere in the tree and revert to it.
    pub async fn revert_to_named(&self, vm: &VmInfo, name: &str) -> VmciResult<SnapshotNode> {
        let snapshot = self.require(vm, name).await?;
        self.revert(vm, &snapshot).await?;
        Ok(snapshot)
    }

    /// Disk-only, crash-consistent snapshot: no memory dump, no quiescing.
    pub async fn create(
        &self,
        vm: &VmInfo,
        name: &str,
        description: &str,
    ) -> VmciResult<SnapshotId> {
        tracing::info!(vm = %vm.name, snapshot = %name, "Taking snapshot");
        let request = SnapshotRequest {
            name: name.to_string(),
            description: description.to_string(),
            memory: false,
            quiesce: false,
        };
        self.hypervisor.create_snapshot(&vm.id, &request).await
    }

    /// Create `{prefix}{%Y%m%d%H%M%S}` and return its name.
    pub async fn create_timestamped(
        &self,
        vm: &VmInfo,
        prefix: &str,
        now: NaiveDateTime,
    ) -> VmciResult<String> {
        let (name, description) = timestamped_name(prefix, now);
        self.create(vm, &name, &description).await?;
        Ok(name)
    }

    /// Delete all but the `keep` newest snapshots whose name starts with the
    /// policy prefix. Children of a deleted snapshot are kept.
    ///
    /// Returns the deleted names, oldest last.
    pub async fn prune(&self, vm: &VmInfo, policy: &RetentionPolicy) -> VmciResult<Vec<String>> {
        let tree = self.hypervisor.snapshot_tree(&vm.id).await?;
        let mut matching: Vec<&SnapshotNode> = flatten(&tree)
            .into_iter()
            .filter(|node| node.name.starts_with(&policy.prefix))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut deleted = Vec::new();
        for node in matching.into_iter().skip(policy.keep) {
            tracing::debug!(vm = %vm.name, snapshot = %node.name, "Deleting old snapshot");
            self.hypervisor
                .remove_snapshot(&vm.id, &node.id, false)
                .await?;
            deleted.push(node.name.clone());
        }

        if !deleted.is_empty() {
            tracing::info!(vm = %vm.name, deleted = deleted.len(), "Pruned old snapshots");
        }
        Ok(deleted)
    }

    /// Known-good snapshot recorded for `vm`, if any.
    pub fn known_good(&self, vm: &VmInfo) -> VmciResult<Option<String>> {
        let index = KnownGoodIndex::load(&self.index_path)?;
        Ok(index.get(&vm.uuid).map(str::to_string))
    }

    /// Snapshot a run should start from: `explicit`, else the recorded one.
    pub fn resolve_known_good(&self, vm: &VmInfo, explicit: Option<&str>) -> VmciResult<String> {
        if let Some(name) = explicit {
            return Ok(name.to_string());
        }
        self.known_good(vm)?
            .ok_or_else(|| VmciError::SnapshotNotFound {
                vm: vm.name.clone(),
                snapshot: "<no known-good snapshot recorded>".to_string(),
            })
    }

    pub fn record_known_good(&self, vm: &VmInfo, snapshot: &str) -> VmciResult<()> {
        let mut index = KnownGoodIndex::load(&self.index_path)?;
        index.set(
            vm.uuid.clone(),
            KnownGood {
                snapshot: snapshot.to_string(),
                vm_name: vm.name.clone(),
                saved_at: Utc::now(),
            },
        );
        index.save(&self.index_path)?;
        tracing::debug!(vm = %vm.name, snapshot, "Recorded known-good snapshot");
        Ok(())
    }
}
