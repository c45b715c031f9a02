use super::phase::PowerPhase;
use crate::hypervisor::{Hypervisor, PowerState, VmInfo};
use crate::runtime::options::Timings;
use std::sync::Arc;
use std::time::Duration;
use vmci_shared::errors::{VmciError, VmciResult};

/// Drives one leased VM through its power lifecycle with bounded waits.
pub struct PowerController {
    hypervisor: Arc<dyn Hypervisor>,
    vm: VmInfo,
    phase: PowerPhase,
    boot_attempts: u32,
    boot_poll_interval: Duration,
    boot_settle: Duration,
    shutdown_grace: Duration,
}

impl PowerController {
    /// Controller for `vm`, which is expected to be powered off.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, vm: VmInfo, timings: &Timings) -> Self {
        Self {
            hypervisor,
            vm,
            phase: PowerPhase::Off,
            boot_attempts: timings.boot_attempts,
            boot_poll_interval: timings.boot_poll_interval.as_duration(),
            boot_settle: timings.boot_settle.as_duration(),
            shutdown_grace: timings.shutdown_grace.as_duration(),
        }
    }

    pub fn phase(&self) -> PowerPhase {
        self.phase
    }

    pub fn vm(&self) -> &VmInfo {
        &self.vm
    }

    /// Power on and wait until the guest is ready.
    ///
    /// Polls up to `boot_attempts` times for "powered on and tools ready",
    /// then waits `boot_settle` more. Fails with `BootTimeout` once the budget
    /// is spent; the VM is left powered on for the caller to deal with.
    pub async fn power_on(&mut self) -> VmciResult<()> {
        self.transition(PowerPhase::PoweringOn)?;
        tracing::info!(vm = %self.vm.name, "Powering on");
        self.hypervisor.power_on(&self.vm.id).await?;
        self.transition(PowerPhase::WaitingForGuest)?;

        for attempt in 1..=self.boot_attempts {
            let info = self.hypervisor.vm_info(&self.vm.id).await?;
            if info.is_guest_ready() {
                tokio::time::sleep(self.boot_settle).await;
                self.transition(PowerPhase::Ready)?;
                tracing::info!(vm = %self.vm.name, attempt, "VM is ready");
                return Ok(());
            }

            if info.power_state != PowerState::PoweredOn {
                tracing::debug!(vm = %self.vm.name, attempt, "VM is not yet powered on");
            } else {
                tracing::debug!(vm = %self.vm.name, attempt, "VM is not yet fully booted");
            }
            tokio::time::sleep(self.boot_poll_interval).await;
        }

        Err(VmciError::BootTimeout {
            vm: self.vm.name.clone(),
            attempts: self.boot_attempts,
        })
    }

    /// Graceful shutdown, forced off if the guest is still up after the grace period.
    pub async fn shutdown(&mut self) -> VmciResult<()> {
        if self.phase.is_off() {
            return Ok(());
        }
        self.transition(PowerPhase::ShuttingDown)?;
        tracing::info!(vm = %self.vm.name, "Shutting down");

        if let Err(e) = self.hypervisor.shutdown_guest(&self.vm.id).await {
            // The forced path below still gets the VM off.
            tracing::warn!(vm = %self.vm.name, error = %e, "Graceful shutdown request failed");
        }
        tokio::time::sleep(self.shutdown_grace).await;

        let info = self.hypervisor.vm_info(&self.vm.id).await?;
        if !info.is_powered_off() {
            tracing::warn!(
                vm = %self.vm.name,
                power_state = %info.power_state,
                "Still running after grace period, forcing power off"
            );
            self.hypervisor.power_off(&self.vm.id).await?;
        }
        self.transition(PowerPhase::Off)
    }

    /// Hard power-off, no grace period. Does nothing if the VM is already off.
    pub async fn force_off(&mut self) -> VmciResult<()> {
        let info = self.hypervisor.vm_info(&self.vm.id).await?;
        if info.is_powered_off() {
            tracing::debug!(vm = %self.vm.name, "Already powered off");
        } else {
            tracing::warn!(vm = %self.vm.name, "Forcing power off");
            self.hypervisor.power_off(&self.vm.id).await?;
        }
        self.phase = PowerPhase::Off;
        Ok(())
    }

    /// Shut down and power back on, e.g. to pick up updates.
    pub async fn power_cycle(&mut self) -> VmciResult<()> {
        self.shutdown().await?;
        self.power_on().await
    }

    fn transition(&mut self, target: PowerPhase) -> VmciResult<()> {
        if !self.phase.can_transition_to(target) {
            return Err(VmciError::InvalidState(format!(
                "{}: cannot go from {} to {}",
                self.vm.name, self.phase, target
            )));
        }
        tracing::trace!(vm = %self.vm.name, from = %self.phase, to = %target, "Power phase");
        self.phase = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::memory::{
        BootBehavior, Call, InMemoryHypervisor, MemoryVm, ShutdownBehavior,
    };
    use tokio::time::Instant;

    async fn controller(vm: MemoryVm) -> (InMemoryHypervisor, PowerController) {
        let hv = InMemoryHypervisor::new();
        let id = hv.add_vm(vm);
        let info = hv.vm_info(&id).await.unwrap();
        let ctl = PowerController::new(Arc::new(hv.clone()), info, &Timings::default());
        (hv, ctl)
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_waits_for_tools_then_settles() {
        let (_hv, mut ctl) =
            controller(MemoryVm::new("vm").boot(BootBehavior::ReadyAfterPolls(2))).await;
        let started = Instant::now();

        ctl.power_on().await.unwrap();

        assert_eq!(ctl.phase(), PowerPhase::Ready);
        // Two not-ready polls, then ready on the third, then the settle delay.
        assert_eq!(started.elapsed(), Duration::from_secs(2 * 10 + 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_timeout_after_attempt_budget() {
        let (hv, mut ctl) = controller(MemoryVm::new("vm").boot(BootBehavior::Never)).await;
        let started = Instant::now();

        let err = ctl.power_on().await.unwrap_err();

        assert!(matches!(err, VmciError::BootTimeout { attempts: 10, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(10 * 10));
        assert_eq!(ctl.phase(), PowerPhase::WaitingForGuest);
        assert_eq!(hv.power_state("vm"), Some(PowerState::PoweredOn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_skips_power_off() {
        let (hv, mut ctl) = controller(MemoryVm::new("vm")).await;
        ctl.power_on().await.unwrap();

        ctl.shutdown().await.unwrap();

        assert_eq!(ctl.phase(), PowerPhase::Off);
        assert_eq!(hv.count_calls(|c| matches!(c, Call::ShutdownGuest(_))), 1);
        assert_eq!(hv.count_calls(|c| matches!(c, Call::PowerOff(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_guest_is_forced_off() {
        let (hv, mut ctl) =
            controller(MemoryVm::new("vm").shutdown(ShutdownBehavior::Hang)).await;
        ctl.power_on().await.unwrap();
        let started = Instant::now();

        ctl.shutdown().await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(hv.power_state("vm"), Some(PowerState::PoweredOff));
        assert_eq!(hv.count_calls(|c| matches!(c, Call::PowerOff(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_off_when_already_off() {
        let (hv, mut ctl) = controller(MemoryVm::new("vm")).await;

        ctl.force_off().await.unwrap();

        assert_eq!(hv.count_calls(|c| matches!(c, Call::PowerOff(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_from_ready_is_rejected() {
        let (_hv, mut ctl) = controller(MemoryVm::new("vm")).await;
        ctl.power_on().await.unwrap();

        let err = ctl.power_on().await.unwrap_err();
        assert!(matches!(err, VmciError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_cycle() {
        let (hv, mut ctl) = controller(MemoryVm::new("vm")).await;
        ctl.power_on().await.unwrap();

        ctl.power_cycle().await.unwrap();

        assert!(ctl.phase().is_ready());
        assert_eq!(hv.count_calls(|c| matches!(c, Call::PowerOn(_))), 2);
    }
}
