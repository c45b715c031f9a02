//! Remote command channel.
//!
//! The control plane only offers "start a process" and "list processes", so
//! completion is observed by polling the listing for the process's exit code.
//! A missing or negative code means the process is still running.

use super::command::{ExitStatus, GuestCommand, WaitMode};
use crate::hypervisor::{Hypervisor, VmId};
use crate::runtime::options::Timings;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vmci_shared::errors::{VmciError, VmciResult};

/// Runs commands inside a guest and waits for them by polling.
#[derive(Clone)]
pub struct CommandChannel {
    hypervisor: Arc<dyn Hypervisor>,
    poll_interval: Duration,
    settle_delay: Duration,
    max_wait: Option<Duration>,
    cancel: CancellationToken,
}

impl CommandChannel {
    /// Channel with the poll interval and settle delay of `timings`.
    ///
    /// Blocking waits are unbounded until [`with_max_wait`](Self::with_max_wait)
    /// sets a limit.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, timings: &Timings) -> Self {
        Self {
            hypervisor,
            poll_interval: timings.command_poll_interval.as_duration(),
            settle_delay: timings.command_settle.as_duration(),
            max_wait: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Abort pending waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Start `command` in the guest of `vm` and wait for it per its [`WaitMode`].
    pub async fn execute(&self, vm: &VmId, command: &GuestCommand) -> VmciResult<ExitStatus> {
        tracing::debug!(vm = %vm, command = %command, wait = ?command.wait, "Running guest command");

        let pid = self
            .hypervisor
            .start_program(vm, &command.program_spec())
            .await?;
        if pid <= 0 {
            return Err(VmciError::Launch {
                program: command.program.clone(),
                reason: format!("control plane returned pid {}", pid),
            });
        }

        match command.wait {
            WaitMode::Blocking => self.wait_for_exit(vm, command, pid).await,
            WaitMode::FireAndForget => self.sample_after_settle(vm, command, pid).await,
        }
    }

    /// Run `commands` in order, each blocking. The first failure aborts the chain.
    pub async fn execute_chain(&self, vm: &VmId, commands: &[GuestCommand]) -> VmciResult<()> {
        for command in commands {
            if self.cancel.is_cancelled() {
                return Err(VmciError::Cancelled(format!(
                    "chain cancelled before '{}'",
                    command.program
                )));
            }
            let blocking = command.clone().wait(WaitMode::Blocking);
            self.execute(vm, &blocking).await?;
        }
        Ok(())
    }

    async fn wait_for_exit(
        &self,
        vm: &VmId,
        command: &GuestCommand,
        pid: i64,
    ) -> VmciResult<ExitStatus> {
        let started = Instant::now();
        loop {
            match self.exit_code(vm, pid).await? {
                Some(0) => {
                    tracing::debug!(vm = %vm, pid, "Guest program completed with success");
                    return Ok(ExitStatus {
                        pid,
                        exit_code: Some(0),
                    });
                }
                Some(code) => return Err(self.failed(vm, command, pid, code).await),
                None => {
                    tracing::debug!(vm = %vm, pid, "Guest program running");
                }
            }

            if let Some(max_wait) = self.max_wait
                && started.elapsed() >= max_wait
            {
                return Err(VmciError::CommandTimeout {
                    program: command.program.clone(),
                    waited: started.elapsed(),
                });
            }

            self.pause(self.poll_interval, command).await?;
        }
    }

    async fn sample_after_settle(
        &self,
        vm: &VmId,
        command: &GuestCommand,
        pid: i64,
    ) -> VmciResult<ExitStatus> {
        self.pause(self.settle_delay, command).await?;

        match self.exit_code(vm, pid).await? {
            Some(code) if code > 0 => Err(self.failed(vm, command, pid, code).await),
            Some(code) => Ok(ExitStatus {
                pid,
                exit_code: Some(code),
            }),
            None => {
                // One sample is a weak signal: the program may still fail later.
                tracing::warn!(
                    vm = %vm,
                    pid,
                    command = %command,
                    "Guest program still running after settle delay, assuming success"
                );
                Ok(ExitStatus {
                    pid,
                    exit_code: None,
                })
            }
        }
    }

    /// Exit code of `pid`, or `None` while it is still running.
    async fn exit_code(&self, vm: &VmId, pid: i64) -> VmciResult<Option<i64>> {
        let listing = self.hypervisor.list_processes(vm, &[pid]).await?;
        let process = listing
            .into_iter()
            .find(|p| p.pid == pid)
            .ok_or_else(|| {
                VmciError::Hypervisor(format!("process {} missing from guest listing", pid))
            })?;
        Ok(process.exit_code.filter(|code| *code >= 0))
    }

    async fn failed(&self, vm: &VmId, command: &GuestCommand, pid: i64, code: i64) -> VmciError {
        tracing::error!(vm = %vm, pid, exit_code = code, command = %command, "Guest program failed");
        if let Ok(detail) = self.hypervisor.list_processes(vm, &[pid]).await {
            tracing::debug!(vm = %vm, pid, processes = ?detail, "Failed process detail");
        }
        VmciError::RemoteExecution {
            program: command.program.clone(),
            exit_code: code,
        }
    }

    async fn pause(&self, delay: Duration, command: &GuestCommand) -> VmciResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(VmciError::Cancelled(format!(
                "wait for '{}' cancelled",
                command.program
            ))),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::PowerState;
    use crate::hypervisor::memory::{Call, InMemoryHypervisor, MemoryVm, ProgramScript};

    fn running_vm(scripts: Vec<ProgramScript>) -> (InMemoryHypervisor, VmId) {
        let mut vm = MemoryVm::new("Qubes_4.2-A").power_state(PowerState::PoweredOn);
        for script in scripts {
            vm = vm.script(script);
        }
        let hv = InMemoryHypervisor::new();
        let id = hv.add_vm(vm);
        (hv, id)
    }

    fn channel(hv: &InMemoryHypervisor) -> CommandChannel {
        CommandChannel::new(Arc::new(hv.clone()), &Timings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_waits_for_exit_code() {
        let (hv, id) = running_vm(vec![ProgramScript::new("/usr/bin/make").after_polls(3)]);
        let started = Instant::now();

        let status = channel(&hv)
            .execute(&id, &GuestCommand::new("/usr/bin/make").args("test"))
            .await
            .unwrap();

        assert_eq!(status.exit_code, Some(0));
        // Three "running" samples, each followed by one poll interval.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_failure_is_remote_execution_error() {
        let (hv, id) = running_vm(vec![
            ProgramScript::new("/usr/bin/make").exits(2).after_polls(1),
        ]);

        let err = channel(&hv)
            .execute(&id, &GuestCommand::new("/usr/bin/make"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            VmciError::RemoteExecution { exit_code: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure() {
        let (hv, id) = running_vm(vec![ProgramScript::new("/bin/missing").fails_to_launch()]);

        let err = channel(&hv)
            .execute(&id, &GuestCommand::new("/bin/missing"))
            .await
            .unwrap_err();

        assert!(matches!(err, VmciError::Launch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_samples_once() {
        let (hv, id) = running_vm(vec![ProgramScript::new("/usr/bin/qvm-run").never_exits()]);
        let started = Instant::now();

        let status = channel(&hv)
            .execute(
                &id,
                &GuestCommand::new("/usr/bin/qvm-run").wait(WaitMode::FireAndForget),
            )
            .await
            .unwrap();

        assert!(status.success());
        assert!(!status.is_confirmed());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_forget_reports_early_failure() {
        let (hv, id) = running_vm(vec![ProgramScript::new("/usr/bin/qvm-run").exits(1)]);

        let err = channel(&hv)
            .execute(
                &id,
                &GuestCommand::new("/usr/bin/qvm-run").wait(WaitMode::FireAndForget),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            VmciError::RemoteExecution { exit_code: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_bounds_blocking_poll() {
        let (hv, id) = running_vm(vec![ProgramScript::new("/usr/bin/sleep").never_exits()]);

        let err = channel(&hv)
            .with_max_wait(Some(Duration::from_secs(60)))
            .execute(&id, &GuestCommand::new("/usr/bin/sleep").args("infinity"))
            .await
            .unwrap_err();

        match err {
            VmciError::CommandTimeout { program, waited } => {
                assert_eq!(program, "/usr/bin/sleep");
                assert_eq!(waited, Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_poll() {
        let (hv, id) = running_vm(vec![ProgramScript::new("/usr/bin/sleep").never_exits()]);
        let token = CancellationToken::new();
        let channel = channel(&hv).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            token.cancel();
        });

        let err = channel
            .execute(&id, &GuestCommand::new("/usr/bin/sleep"))
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, VmciError::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_chain_starts_nothing() {
        let (hv, id) = running_vm(vec![]);
        let token = CancellationToken::new();
        token.cancel();

        let chain = [
            GuestCommand::new("tool").args("step1"),
            GuestCommand::new("tool").args("step2"),
        ];
        let err = channel(&hv)
            .with_cancellation(token)
            .execute_chain(&id, &chain)
            .await
            .unwrap_err();

        assert!(matches!(err, VmciError::Cancelled(_)));
        assert!(
            !hv.calls()
                .iter()
                .any(|c| matches!(c, Call::StartProgram { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_aborts_on_first_failure() {
        let (hv, id) = running_vm(vec![
            ProgramScript::new("tool").args_contain("step1").exits(1),
        ]);

        let chain = [
            GuestCommand::new("tool").args("step1"),
            GuestCommand::new("tool").args("step2"),
        ];
        let err = channel(&hv).execute_chain(&id, &chain).await.unwrap_err();

        assert!(matches!(err, VmciError::RemoteExecution { .. }));
        assert_eq!(
            hv.started_programs("Qubes_4.2-A"),
            vec![("tool".to_string(), "step1".to_string())]
        );
        assert_eq!(
            hv.count_calls(|c| matches!(c, Call::StartProgram { args, .. } if args == "step2")),
            0
        );
    }
}
