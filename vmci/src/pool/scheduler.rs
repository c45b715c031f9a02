use super::lease::{Lease, LeaseTable};
use crate::hypervisor::{Hypervisor, VmInfo};
use crate::runtime::options::{PoolOptions, Timings};
use crate::runtime::types::HolderId;
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vmci_shared::errors::{VmciError, VmciResult};

/// Whether `name` belongs to the pool for `tag`: it contains `prefix` + `tag`.
pub fn matches_version(prefix: &str, name: &str, tag: &str) -> bool {
    name.contains(&format!("{}{}", prefix, tag))
}

/// Reject version tags that are not `<major>.<minor>`.
pub fn validate_version(tag: &str) -> VmciResult<()> {
    let pattern = Regex::new(r"^\d+\.\d+$")
        .map_err(|e| VmciError::Internal(format!("version pattern: {e}")))?;
    if !pattern.is_match(tag) {
        return Err(VmciError::InvalidArgument(format!(
            "version must look like 4.2, got '{}'",
            tag
        )));
    }
    Ok(())
}

/// Finds idle pool VMs for a platform version and leases them.
pub struct PoolScheduler {
    hypervisor: Arc<dyn Hypervisor>,
    leases: Arc<LeaseTable>,
    holder: HolderId,
    name_prefix: String,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl PoolScheduler {
    /// Scheduler leasing on behalf of a fresh holder id.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        leases: LeaseTable,
        options: &PoolOptions,
        timings: &Timings,
    ) -> Self {
        Self {
            hypervisor,
            leases: Arc::new(leases),
            holder: HolderId::new(),
            name_prefix: options.name_prefix.clone(),
            poll_interval: timings.pool_poll_interval.as_duration(),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort a pending [`acquire`](Self::acquire) wait when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    /// Every powered-off VM matching `tag`, in inventory order.
    pub async fn available(&self, tag: &str) -> VmciResult<Vec<VmInfo>> {
        validate_version(tag)?;
        let vms = self.hypervisor.list_vms().await?;
        Ok(vms
            .into_iter()
            .filter(|vm| matches_version(&self.name_prefix, &vm.name, tag) && vm.is_powered_off())
            .collect())
    }

    /// Lease the first idle VM for `tag`, rescanning every poll interval.
    ///
    /// Fails with `NoResourceAvailable` once `timeout` has passed without a
    /// successful lease.
    pub async fn acquire(&self, tag: &str, timeout: Duration) -> VmciResult<Lease> {
        let started = Instant::now();
        loop {
            for vm in self.available(tag).await? {
                if let Some(lease) = self.try_lease(&vm).await? {
                    tracing::info!(vm = %vm.name, holder = %self.holder, "Using machine for CI");
                    return Ok(lease);
                }
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(VmciError::NoResourceAvailable {
                    version: tag.to_string(),
                    waited,
                });
            }

            tracing::info!(
                version = tag,
                retry_in_secs = self.poll_interval.as_secs(),
                "No free VM matching version, sleeping"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(VmciError::Cancelled(format!("wait for a {tag} VM cancelled")));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Lease `vm` if nobody else holds it.
    ///
    /// The claim waits on the lease-table flock, so it runs on the blocking pool.
    pub async fn try_lease(&self, vm: &VmInfo) -> VmciResult<Option<Lease>> {
        let leases = Arc::clone(&self.leases);
        let holder = self.holder.clone();
        let target = vm.clone();
        let claimed =
            tokio::task::spawn_blocking(move || leases.try_claim(&target, &holder, Utc::now()))
                .await
                .map_err(|e| VmciError::Internal(format!("lease claim task failed: {}", e)))??;

        if claimed {
            Ok(Some(Lease::new(
                vm.clone(),
                self.holder.clone(),
                Arc::clone(&self.leases),
            )))
        } else {
            Ok(None)
        }
    }
}
