//! Lease table: explicit ownership records for pool VMs.
//!
//! "Powered off" alone says a VM is idle, not that nobody is about to use it.
//! Before touching a VM a runner claims it here. The table lives in
//! `<home>/leases.json`, and every read-modify-write happens under an
//! exclusive flock on `<home>/leases.lock`, so a claim is a conditional write:
//! it succeeds only if no unexpired record held by another runner exists.

use crate::hypervisor::VmInfo;
use crate::runtime::layout::HomeLayout;
use crate::runtime::lock::FileLock;
use crate::runtime::types::{HolderId, Seconds};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vmci_shared::errors::{VmciError, VmciResult};

/// One claimed VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: HolderId,
    #[serde(default)]
    pub vm_name: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseFile {
    version: String,
    /// VM uuid → record
    leases: HashMap<String, LeaseRecord>,
}

impl Default for LeaseFile {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            leases: HashMap::new(),
        }
    }
}

/// File-backed lease table shared by every runner using the same home dir.
#[derive(Debug)]
pub struct LeaseTable {
    path: PathBuf,
    lock_path: PathBuf,
    ttl: ChronoDuration,
}

impl LeaseTable {
    pub fn new(layout: &HomeLayout, ttl: Seconds) -> Self {
        Self {
            path: layout.leases_file(),
            lock_path: layout.leases_lock(),
            ttl: ChronoDuration::seconds(ttl.as_seconds() as i64),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim `vm` for `holder`.
    ///
    /// Returns `false` when another holder has an unexpired lease. Claiming a
    /// VM the same holder already leases renews it.
    pub fn try_claim(&self, vm: &VmInfo, holder: &HolderId, now: DateTime<Utc>) -> VmciResult<bool> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut file = self.read()?;

        if let Some(existing) = file.leases.get(&vm.uuid)
            && existing.holder != *holder
        {
            if !existing.is_expired(now) {
                tracing::debug!(
                    vm = %vm.name,
                    holder = %existing.holder,
                    expires_at = %existing.expires_at,
                    "VM is leased by another runner"
                );
                return Ok(false);
            }
            tracing::info!(
                vm = %vm.name,
                holder = %existing.holder,
                "Reclaiming expired lease"
            );
        }

        file.leases.insert(
            vm.uuid.clone(),
            LeaseRecord {
                holder: holder.clone(),
                vm_name: vm.name.clone(),
                acquired_at: now,
                expires_at: now + self.ttl,
            },
        );
        self.write(&file)?;
        tracing::debug!(vm = %vm.name, holder = %holder, "Claimed lease");
        Ok(true)
    }

    /// Drop `holder`'s lease on `uuid`. Returns `false` if it held none.
    pub fn release(&self, uuid: &str, holder: &HolderId) -> VmciResult<bool> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let mut file = self.read()?;

        match file.leases.get(uuid) {
            Some(record) if record.holder == *holder => {
                file.leases.remove(uuid);
                self.write(&file)?;
                tracing::debug!(uuid, holder = %holder, "Released lease");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Current unexpired lease on `uuid`.
    pub fn holder_of(&self, uuid: &str, now: DateTime<Utc>) -> VmciResult<Option<LeaseRecord>> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        let file = self.read()?;
        Ok(file
            .leases
            .get(uuid)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    fn read(&self) -> VmciResult<LeaseFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<LeaseFile>(&contents) {
                Ok(file) => Ok(file),
                Err(e) => {
                    tracing::warn!("Corrupted lease table, starting empty: {}", e);
                    Ok(LeaseFile::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LeaseFile::default()),
            Err(e) => Err(VmciError::Storage(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write(&self, file: &LeaseFile) -> VmciResult<()> {
        let json = serde_json::to_string_pretty(file)
            .map_err(|e| VmciError::Storage(format!("failed to serialize leases: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| VmciError::Storage(format!("failed to write leases: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| VmciError::Storage(format!("failed to replace leases: {e}")))
    }
}

/// A VM leased to this runner.
///
/// Released explicitly with [`release`](Lease::release), or on drop if the
/// owner bailed out early.
#[derive(Debug)]
pub struct Lease {
    vm: VmInfo,
    holder: HolderId,
    table: Arc<LeaseTable>,
    released: bool,
}

impl Lease {
    pub(crate) fn new(vm: VmInfo, holder: HolderId, table: Arc<LeaseTable>) -> Self {
        Self {
            vm,
            holder,
            table,
            released: false,
        }
    }

    pub fn vm(&self) -> &VmInfo {
        &self.vm
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    /// Give the VM back. Waits for the lease-table flock on the blocking pool.
    pub async fn release(mut self) -> VmciResult<()> {
        self.released = true;
        let table = Arc::clone(&self.table);
        let uuid = self.vm.uuid.clone();
        let holder = self.holder.clone();
        tokio::task::spawn_blocking(move || table.release(&uuid, &holder))
            .await
            .map_err(|e| VmciError::Internal(format!("lease release task failed: {}", e)))??;
        Ok(())
    }
}

// Fallback for early exits only; the normal path is the async `release`.
impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.table.release(&self.vm.uuid, &self.holder) {
            tracing::warn!(vm = %self.vm.name, error = %e, "Failed to release lease");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{PowerState, ToolsStatus, VmId};
    use tempfile::TempDir;

    fn vm(name: &str) -> VmInfo {
        VmInfo {
            id: VmId::new(name),
            uuid: format!("uuid-{name}"),
            name: name.to_string(),
            power_state: PowerState::PoweredOff,
            tools_status: ToolsStatus::NotRunning,
        }
    }

    fn table(temp: &TempDir) -> LeaseTable {
        LeaseTable::new(
            &HomeLayout::new(temp.path().to_path_buf()),
            Seconds::from_hours(1),
        )
    }

    #[test]
    fn test_second_holder_is_refused() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        let (a, b) = (HolderId::new(), HolderId::new());
        let now = Utc::now();

        assert!(table.try_claim(&vm("A"), &a, now).unwrap());
        assert!(!table.try_claim(&vm("A"), &b, now).unwrap());
        assert!(table.try_claim(&vm("B"), &b, now).unwrap());
        assert_eq!(table.holder_of("uuid-A", now).unwrap().unwrap().holder, a);
    }

    #[test]
    fn test_expired_lease_is_reclaimable() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        let (a, b) = (HolderId::new(), HolderId::new());
        let now = Utc::now();

        assert!(table.try_claim(&vm("A"), &a, now).unwrap());
        let later = now + ChronoDuration::hours(2);
        assert!(table.holder_of("uuid-A", later).unwrap().is_none());
        assert!(table.try_claim(&vm("A"), &b, later).unwrap());
    }

    #[test]
    fn test_release_only_by_holder() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        let (a, b) = (HolderId::new(), HolderId::new());
        let now = Utc::now();

        table.try_claim(&vm("A"), &a, now).unwrap();
        assert!(!table.release("uuid-A", &b).unwrap());
        assert!(table.release("uuid-A", &a).unwrap());
        assert!(table.try_claim(&vm("A"), &b, now).unwrap());
    }

    #[test]
    fn test_lease_released_on_drop() {
        let temp = TempDir::new().unwrap();
        let table = Arc::new(table(&temp));
        let holder = HolderId::new();
        table.try_claim(&vm("A"), &holder, Utc::now()).unwrap();

        drop(Lease::new(vm("A"), holder, Arc::clone(&table)));

        assert!(table.holder_of("uuid-A", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_table_starts_empty() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp);
        std::fs::write(table.path(), "garbage").unwrap();

        assert!(table.try_claim(&vm("A"), &HolderId::new(), Utc::now()).unwrap());
    }
}
