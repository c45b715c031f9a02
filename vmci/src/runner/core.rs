//! The run orchestrator.
//!
//! One `Runner` covers both modes: a CI run (lease one VM, revert, boot, arm
//! the watchdog, update, stage, trigger, fetch the log, shut down) and a save
//! pass (refresh the known-good snapshot of every idle VM). Whatever happens,
//! a leased VM is powered off again before the runner lets go of it.

use super::config::{RunConfig, RunMode};
use super::context::{RunContext, TriggerContext, watchdog_deadline};
use super::outcome::{RunOutcome, RunReport, SaveFailure, SaveReport, SavedSnapshot};
use crate::guest::{CommandChannel, GuestCommand};
use crate::hypervisor::{Hypervisor, VmInfo};
use crate::pool::{Lease, LeaseTable, PoolScheduler, validate_version};
use crate::power::PowerController;
use crate::runtime::layout::HomeLayout;
use crate::runtime::options::RunnerOptions;
use crate::snapshot::{RetentionPolicy, SnapshotManager};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vmci_shared::errors::{VmciError, VmciResult};

/// Orchestrates CI runs and save passes against a VM pool.
pub struct Runner {
    hypervisor: Arc<dyn Hypervisor>,
    options: RunnerOptions,
    layout: HomeLayout,
    scheduler: PoolScheduler,
    snapshots: SnapshotManager,
    cancel: CancellationToken,
}

impl Runner {
    /// Prepare the home directory and wire up the components.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        layout: HomeLayout,
        options: RunnerOptions,
    ) -> VmciResult<Self> {
        options.validate()?;
        layout.prepare()?;
        std::fs::create_dir_all(options.reports_dir(&layout))
            .map_err(|e| VmciError::Storage(format!("failed to create reports dir: {e}")))?;

        let cancel = CancellationToken::new();
        let leases = LeaseTable::new(&layout, options.pool.lease_ttl);
        let scheduler = PoolScheduler::new(
            Arc::clone(&hypervisor),
            leases,
            &options.pool,
            &options.timings,
        )
        .with_cancellation(cancel.clone());
        let snapshots = SnapshotManager::new(Arc::clone(&hypervisor), layout.known_good_index());

        Ok(Self {
            hypervisor,
            options,
            layout,
            scheduler,
            snapshots,
            cancel,
        })
    }

    /// Token that aborts pending pool and guest command waits when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn scheduler(&self) -> &PoolScheduler {
        &self.scheduler
    }

    pub async fn execute(&self, config: &RunConfig) -> VmciResult<RunReport> {
        match &config.mode {
            RunMode::Ci(trigger) => self.run(config, trigger).await.map(RunReport::Ci),
            RunMode::Save => self.save(config).await.map(RunReport::Save),
        }
    }

    // ========================================================================
    // CI RUN
    // ========================================================================

    /// Lease a VM for `config.version` and run CI on it.
    ///
    /// On failure the VM is forced off before the error is returned; no
    /// snapshot of the failed state is ever taken.
    pub async fn run(&self, config: &RunConfig, trigger: &TriggerContext) -> VmciResult<RunOutcome> {
        validate_version(&config.version)?;
        let started_at = Local::now();
        let lease = self
            .scheduler
            .acquire(&config.version, self.options.timings.pool_timeout.as_duration())
            .await?;

        let mut power = self.power(lease.vm());
        let result = self
            .run_on(&lease, &mut power, config, trigger, started_at)
            .await;

        let result = match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    vm = %lease.vm().name,
                    error = %e,
                    "Error occurred during execution"
                );
                if let Err(off_err) = power.force_off().await {
                    tracing::error!(vm = %lease.vm().name, error = %off_err, "Forced power off failed");
                }
                Err(e)
            }
        };

        if let Err(e) = lease.release().await {
            tracing::warn!(error = %e, "Failed to release lease");
        }
        result
    }

    async fn run_on(
        &self,
        lease: &Lease,
        power: &mut PowerController,
        config: &RunConfig,
        trigger: &TriggerContext,
        started_at: DateTime<Local>,
    ) -> VmciResult<RunOutcome> {
        let vm = lease.vm();
        let snapshot = self
            .snapshots
            .resolve_known_good(vm, config.snapshot.as_deref())?;
        self.snapshots.revert_to_named(vm, &snapshot).await?;

        power.power_on().await?;

        let channel = self.channel();
        let mut armed_at = self.arm_watchdog(vm, &channel).await?;

        if config.update {
            self.apply_updates(vm, &channel).await?;
            power.power_cycle().await?;
            // The reboot dropped the pending shutdown.
            armed_at = self.arm_watchdog(vm, &channel).await?;
        }

        let context = RunContext::new(
            trigger,
            &config.version,
            &vm.name,
            &snapshot,
            started_at,
            watchdog_deadline(armed_at, self.options.timings.watchdog.as_duration()),
        );
        tracing::info!(
            vm = %vm.name,
            commit = %context.commit,
            reason = %context.reason,
            log_file = %context.log_file,
            deadline = %context.deadline,
            "Commencing CI execution"
        );

        self.stage(vm, &channel, trigger, &context).await?;
        channel
            .execute(&vm.id, &self.options.guest.entrypoint)
            .await?;
        let report_path = self.fetch_log(vm, &context).await?;

        power.shutdown().await?;

        Ok(RunOutcome {
            vm: vm.name.clone(),
            snapshot,
            commit: context.commit,
            reason: context.reason,
            log_file: context.log_file,
            report_path,
            started_at: context.started_at,
            deadline: context.deadline,
        })
    }

    /// Copy inputs, the trigger context and the log name into the guest, then
    /// run the post-stage chain.
    async fn stage(
        &self,
        vm: &VmInfo,
        channel: &CommandChannel,
        trigger: &TriggerContext,
        context: &RunContext,
    ) -> VmciResult<()> {
        let guest = &self.options.guest;

        for file in &guest.staging {
            let data = std::fs::read(&file.source).map_err(|e| {
                VmciError::Storage(format!("failed to read {}: {}", file.source.display(), e))
            })?;
            self.hypervisor
                .upload_file(&vm.id, &file.guest_path, data)
                .await?;
            tracing::debug!(vm = %vm.name, path = %file.guest_path, "Uploaded input file");
        }

        let context_json = serde_json::to_vec_pretty(trigger)
            .map_err(|e| VmciError::Internal(format!("failed to serialize context: {e}")))?;
        self.hypervisor
            .upload_file(&vm.id, &guest.context_path, context_json)
            .await?;

        self.hypervisor
            .upload_file(
                &vm.id,
                &guest.log_marker_path,
                format!("{}\n", context.log_file).into_bytes(),
            )
            .await?;

        channel
            .execute_chain(&vm.id, &guest.post_stage_commands)
            .await
    }

    async fn fetch_log(&self, vm: &VmInfo, context: &RunContext) -> VmciResult<PathBuf> {
        let source = self.options.guest.log_path(&context.log_file);
        let data = self.hypervisor.download_file(&vm.id, &source).await?;

        let dest = self
            .options
            .reports_dir(&self.layout)
            .join(&context.log_file);
        std::fs::write(&dest, data)
            .map_err(|e| VmciError::Storage(format!("failed to write {}: {}", dest.display(), e)))?;

        tracing::info!(vm = %vm.name, report = %dest.display(), "Fetched log artifact");
        Ok(dest)
    }

    // ========================================================================
    // SAVE PASS
    // ========================================================================

    /// Refresh the known-good snapshot of every idle VM matching the version.
    ///
    /// A failure on one VM is recorded and the pass moves on to the next.
    /// Once the runner is cancelled the remaining VMs are left untouched and
    /// reported as skipped.
    pub async fn save(&self, config: &RunConfig) -> VmciResult<SaveReport> {
        let mut report = SaveReport::default();
        let candidates = self.scheduler.available(&config.version).await?;
        if candidates.is_empty() {
            tracing::warn!(version = %config.version, "No idle VM matches version, nothing to save");
        }

        for (index, vm) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let remaining = &candidates[index..];
                tracing::warn!(remaining = remaining.len(), "Save pass cancelled, skipping remaining VMs");
                report
                    .skipped
                    .extend(remaining.iter().map(|vm| vm.name.clone()));
                break;
            }

            let Some(lease) = self.scheduler.try_lease(vm).await? else {
                tracing::info!(vm = %vm.name, "Leased by another runner, skipping");
                report.skipped.push(vm.name.clone());
                continue;
            };

            let mut power = self.power(vm);
            match self.save_on(vm, &mut power, config).await {
                Ok(saved) => report.saved.push(saved),
                Err(e) => {
                    tracing::error!(vm = %vm.name, error = %e, "Error occurred during execution");
                    if let Err(off_err) = power.force_off().await {
                        tracing::error!(vm = %vm.name, error = %off_err, "Forced power off failed");
                    }
                    report.failed.push(SaveFailure::new(&vm.name, &e));
                }
            }

            if let Err(e) = lease.release().await {
                tracing::warn!(vm = %vm.name, error = %e, "Failed to release lease");
            }
        }

        Ok(report)
    }

    async fn save_on(
        &self,
        vm: &VmInfo,
        power: &mut PowerController,
        config: &RunConfig,
    ) -> VmciResult<SavedSnapshot> {
        let snapshot = self
            .snapshots
            .resolve_known_good(vm, config.snapshot.as_deref())?;
        self.snapshots.revert_to_named(vm, &snapshot).await?;
        power.power_on().await?;

        if config.update {
            let channel = self.channel();
            self.apply_updates(vm, &channel).await?;
        }

        // Disk-only snapshots are taken powered off.
        power.shutdown().await?;

        let policy = RetentionPolicy::default();
        let name = self
            .snapshots
            .create_timestamped(vm, &policy.prefix, Local::now().naive_local())
            .await?;
        self.snapshots.record_known_good(vm, &name)?;

        // The new known-good snapshot stands even if cleanup fails.
        let pruned = match self.snapshots.prune(vm, &policy).await {
            Ok(pruned) => pruned,
            Err(e) => {
                tracing::warn!(vm = %vm.name, snapshot = %name, error = %e, "Pruning old snapshots failed");
                Vec::new()
            }
        };

        Ok(SavedSnapshot {
            vm: vm.name.clone(),
            snapshot: name,
            pruned,
        })
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Schedule the in-guest self-shutdown. Returns when it was armed.
    async fn arm_watchdog(
        &self,
        vm: &VmInfo,
        channel: &CommandChannel,
    ) -> VmciResult<DateTime<Local>> {
        let minutes = self.options.timings.watchdog.as_minutes();
        channel
            .execute(&vm.id, &self.options.guest.watchdog_command(minutes))
            .await?;
        tracing::debug!(vm = %vm.name, minutes, "Armed guest watchdog");
        Ok(Local::now())
    }

    async fn apply_updates(&self, vm: &VmInfo, channel: &CommandChannel) -> VmciResult<()> {
        tracing::info!(vm = %vm.name, "Applying updates");
        let commands: &[GuestCommand] = &self.options.guest.update_commands;
        channel.execute_chain(&vm.id, commands).await
    }

    fn channel(&self) -> CommandChannel {
        CommandChannel::new(Arc::clone(&self.hypervisor), &self.options.timings)
            .with_max_wait(
                self.options
                    .timings
                    .command_max_wait
                    .map(|max| max.as_duration()),
            )
            .with_cancellation(self.cancel.clone())
    }

    fn power(&self, vm: &VmInfo) -> PowerController {
        PowerController::new(
            Arc::clone(&self.hypervisor),
            vm.clone(),
            &self.options.timings,
        )
    }
}
