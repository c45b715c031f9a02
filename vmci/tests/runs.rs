//! End-to-end runs of the orchestrator against an in-memory pool.

use std::time::Duration;
use tokio::time::Instant;
use vmci::hypervisor::memory::{BootBehavior, Call, Fault, ProgramScript, ShutdownBehavior};
use vmci::runtime::{Seconds, StagedFile};
use vmci::snapshot::flatten;
use vmci::{
    GuestCommand, Hypervisor, PowerState, RunConfig, RunReport, RunnerOptions, TriggerContext,
    VmciError,
};
use vmci_test_utils::{BASE_SNAPSHOT, TestHome, chain, pool, pool_vm};

// ============================================================================
// TEST FIXTURES
// ============================================================================

const VM: &str = "Qubes_4.2-A";

fn ci(commit: &str) -> RunConfig {
    RunConfig::ci("4.2", TriggerContext::manual(commit).unwrap())
        .with_snapshot(Some(BASE_SNAPSHOT.to_string()))
}

fn power_offs(hv: &vmci::InMemoryHypervisor) -> usize {
    hv.count_calls(|c| matches!(c, Call::PowerOff(_)))
}

// ============================================================================
// CI RUNS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn ci_run_follows_the_full_sequence() {
    let home = TestHome::new();
    let hv = pool(&[VM]);
    let runner = home.runner(&hv);

    let trigger = TriggerContext::from_json(
        r#"{"commit":"deadbeef","reason":"push","author":"dev","pr":7}"#,
    )
    .unwrap();
    let config = RunConfig::ci("4.2", trigger).with_snapshot(Some(BASE_SNAPSHOT.into()));

    let RunReport::Ci(outcome) = runner.execute(&config).await.unwrap() else {
        panic!("expected a CI outcome");
    };
    assert_eq!(outcome.reason, "push");
    assert_eq!(std::fs::read_to_string(&outcome.report_path).unwrap(), "ok\n");
    assert!(outcome.report_path.starts_with(home.layout.reports_dir()));

    let calls: Vec<Call> = hv
        .calls()
        .into_iter()
        .filter(|c| !matches!(c, Call::ListVms))
        .collect();
    assert_eq!(
        calls[0],
        Call::Revert {
            vm: VM.into(),
            snapshot: BASE_SNAPSHOT.into()
        }
    );
    assert_eq!(calls[1], Call::PowerOn(VM.into()));
    assert!(matches!(&calls[2], Call::StartProgram { args, .. } if args.ends_with("-h +110")));
    assert!(matches!(calls.last(), Some(Call::ShutdownGuest(_))));

    let context = hv.guest_file(VM, "/home/user/context.json").unwrap();
    let context: serde_json::Value = serde_json::from_slice(&context).unwrap();
    assert_eq!(context["pr"], 7);
    assert_eq!(context["author"], "dev");

    let marker = hv.guest_file(VM, "/home/user/.logfile").unwrap();
    assert_eq!(String::from_utf8(marker).unwrap().trim(), outcome.log_file);
}

#[tokio::test(start_paused = true)]
async fn staged_files_reach_the_guest() {
    let home = TestHome::new();
    let hv = pool(&[VM]);
    let input = home.path().join("input.json");
    std::fs::write(&input, br#"{"target":"all"}"#).unwrap();

    let mut options = RunnerOptions::default();
    options.guest.staging.push(StagedFile {
        source: input,
        guest_path: "/home/user/input.json".into(),
    });
    let runner = home.runner_with(&hv, options);

    runner.execute(&ci("abc")).await.unwrap();
    assert_eq!(
        hv.guest_file(VM, "/home/user/input.json").unwrap(),
        br#"{"target":"all"}"#.to_vec()
    );
}

#[tokio::test(start_paused = true)]
async fn failing_chain_stops_at_first_step() {
    let home = TestHome::new();
    let hv = vmci::InMemoryHypervisor::new().with_vm(
        pool_vm(VM).script(ProgramScript::new("/usr/bin/step1").exits(1)),
    );

    let mut options = RunnerOptions::default();
    options.guest.post_stage_commands = vec![
        GuestCommand::new("/usr/bin/step1"),
        GuestCommand::new("/usr/bin/step2"),
    ];
    let runner = home.runner_with(&hv, options);

    let err = runner.execute(&ci("abc")).await.unwrap_err();
    match err {
        VmciError::RemoteExecution { program, exit_code } => {
            assert_eq!(program, "/usr/bin/step1");
            assert_eq!(exit_code, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    let programs: Vec<String> = hv.started_programs(VM).into_iter().map(|(p, _)| p).collect();
    assert!(programs.contains(&"/usr/bin/step1".to_string()));
    assert!(!programs.contains(&"/usr/bin/step2".to_string()));
    assert!(!programs.contains(&"/usr/bin/qvm-run".to_string()));
    assert_eq!(power_offs(&hv), 1);
}

#[tokio::test(start_paused = true)]
async fn error_mid_run_forces_off_exactly_once() {
    let home = TestHome::new();
    let hv = pool(&[VM]);
    hv.inject_fault(VM, Fault::Upload);
    let runner = home.runner(&hv);

    assert!(runner.execute(&ci("abc")).await.is_err());

    assert_eq!(power_offs(&hv), 1);
    assert_eq!(hv.power_state(VM), Some(PowerState::PoweredOff));
    assert_eq!(hv.count_calls(|c| matches!(c, Call::CreateSnapshot { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn guest_that_never_boots_times_out() {
    let home = TestHome::new();
    let hv = vmci::InMemoryHypervisor::new().with_vm(pool_vm(VM).boot(BootBehavior::Never));
    let runner = home.runner(&hv);

    let started = Instant::now();
    let err = runner.execute(&ci("abc")).await.unwrap_err();

    match err {
        VmciError::BootTimeout { vm, attempts } => {
            assert_eq!(vm, VM);
            assert_eq!(attempts, 10);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(started.elapsed(), Duration::from_secs(100));
    assert_eq!(power_offs(&hv), 1);
    assert!(hv.started_programs(VM).is_empty());
}

#[tokio::test(start_paused = true)]
async fn hung_shutdown_is_forced_after_grace() {
    let home = TestHome::new();
    let hv = vmci::InMemoryHypervisor::new()
        .with_vm(pool_vm(VM).shutdown(ShutdownBehavior::Hang));
    let runner = home.runner(&hv);

    runner.execute(&ci("abc")).await.unwrap();

    assert_eq!(power_offs(&hv), 1);
    assert_eq!(hv.power_state(VM), Some(PowerState::PoweredOff));
}

#[tokio::test(start_paused = true)]
async fn cancelled_runner_aborts_blocking_command() {
    let home = TestHome::new();
    let hv = vmci::InMemoryHypervisor::new().with_vm(
        pool_vm(VM).script(ProgramScript::new("/usr/bin/step1").never_exits()),
    );
    let mut options = RunnerOptions::default();
    options.timings.command_max_wait = None;
    options.guest.post_stage_commands = vec![GuestCommand::new("/usr/bin/step1")];
    let runner = home.runner_with(&hv, options);

    let token = runner.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        token.cancel();
    });

    let err = runner.execute(&ci("abc")).await.unwrap_err();
    assert_eq!(err.kind(), "cancelled");
    assert_eq!(power_offs(&hv), 1);
}

#[tokio::test]
async fn run_start_is_taken_before_boot() {
    let home = TestHome::new();
    let hv = pool(&[VM]);
    let mut options = RunnerOptions::default();
    options.timings.boot_poll_interval = Seconds::from_seconds(1);
    options.timings.boot_settle = Seconds::from_seconds(1);
    options.timings.command_poll_interval = Seconds::from_seconds(1);
    options.timings.command_settle = Seconds::from_seconds(0);
    options.timings.shutdown_grace = Seconds::from_seconds(0);
    let watchdog = chrono::Duration::seconds(options.timings.watchdog.as_seconds() as i64);
    let runner = home.runner_with(&hv, options);

    let before = chrono::Local::now();
    let RunReport::Ci(outcome) = runner.execute(&ci("abc")).await.unwrap() else {
        panic!("expected a CI outcome");
    };

    assert!(outcome.started_at >= before);
    let stamp = outcome.started_at.format("%Y-%m-%d-%H%M%S%6f").to_string();
    assert!(outcome.log_file.starts_with(&stamp));

    // The watchdog is armed only after the guest has booted and settled.
    let armed_at = outcome.deadline - watchdog;
    assert!(armed_at - outcome.started_at >= chrono::Duration::seconds(1));
}

// ============================================================================
// SAVE PASSES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn save_refreshes_known_good_for_later_runs() {
    let home = TestHome::new();
    let hv = pool(&[VM]);
    let runner = home.runner(&hv);

    let save = RunConfig::save("4.2")
        .with_snapshot(Some(BASE_SNAPSHOT.into()))
        .with_update(true);
    let RunReport::Save(report) = runner.execute(&save).await.unwrap() else {
        panic!("expected a save report");
    };
    assert!(report.is_success());
    let saved = report.saved[0].snapshot.clone();

    let programs = hv.started_programs(VM);
    assert!(programs.iter().any(|(_, args)| args.contains("qubes-dom0-update")));

    let config = RunConfig::ci("4.2", TriggerContext::manual("abc").unwrap());
    let RunReport::Ci(outcome) = runner.execute(&config).await.unwrap() else {
        panic!("expected a CI outcome");
    };
    assert_eq!(outcome.snapshot, saved);
}

#[tokio::test(start_paused = true)]
async fn save_continues_past_failing_vm() {
    let home = TestHome::new();
    let hv = pool(&["Qubes_4.2-A", "Qubes_4.2-B", "Qubes_4.2-C"]);
    hv.inject_fault("Qubes_4.2-B", Fault::CreateSnapshot);
    let runner = home.runner(&hv);

    let save = RunConfig::save("4.2").with_snapshot(Some(BASE_SNAPSHOT.into()));
    let RunReport::Save(report) = runner.execute(&save).await.unwrap() else {
        panic!("expected a save report");
    };

    let saved: Vec<&str> = report.saved.iter().map(|s| s.vm.as_str()).collect();
    assert_eq!(saved, vec!["Qubes_4.2-A", "Qubes_4.2-C"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].vm, "Qubes_4.2-B");

    for vm in hv.list_vms().await.unwrap() {
        assert!(vm.is_powered_off(), "{} left running", vm.name);
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_saves_keep_three_update_snapshots() {
    let home = TestHome::new();
    let hv = pool(&[VM]);
    let runner = home.runner(&hv);

    let vm = hv.list_vms().await.unwrap().remove(0);
    runner.snapshots().record_known_good(&vm, BASE_SNAPSHOT).unwrap();

    for _ in 0..5 {
        let RunReport::Save(report) = runner.execute(&RunConfig::save("4.2")).await.unwrap()
        else {
            panic!("expected a save report");
        };
        assert!(report.is_success());
    }

    let tree = hv.snapshots_of(VM);
    let updates = flatten(&tree)
        .into_iter()
        .filter(|n| n.name.starts_with("update_"))
        .count();
    assert_eq!(updates, 3);
    assert_eq!(hv.count_calls(|c| matches!(c, Call::RemoveSnapshot { .. })), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_save_stops_the_pass() {
    let home = TestHome::new();
    let hv = vmci::InMemoryHypervisor::new();
    let runner = home.runner(&hv);

    let token = runner.cancellation_token();
    hv.add_vm(
        pool_vm("Qubes_4.2-A").script(
            ProgramScript::new("/usr/bin/sudo")
                .args_contain("qubes-dom0-update")
                .on_start(move |_| token.cancel()),
        ),
    );
    hv.add_vm(pool_vm("Qubes_4.2-B"));
    hv.add_vm(pool_vm("Qubes_4.2-C"));

    let save = RunConfig::save("4.2")
        .with_snapshot(Some(BASE_SNAPSHOT.into()))
        .with_update(true);
    let RunReport::Save(report) = runner.execute(&save).await.unwrap() else {
        panic!("expected a save report");
    };

    assert!(report.saved.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].vm, "Qubes_4.2-A");
    assert_eq!(report.failed[0].kind, "cancelled");
    assert_eq!(report.skipped, vec!["Qubes_4.2-B", "Qubes_4.2-C"]);

    // The second update step never started and nothing was snapshotted.
    assert!(
        !hv.started_programs("Qubes_4.2-A")
            .iter()
            .any(|(_, args)| args.contains("qubes-vm-update"))
    );
    assert_eq!(hv.count_calls(|c| matches!(c, Call::CreateSnapshot { .. })), 0);
    assert_eq!(hv.count_calls(|c| matches!(c, Call::PowerOn(_))), 1);
    for vm in hv.list_vms().await.unwrap() {
        assert!(vm.is_powered_off(), "{} left running", vm.name);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_prune_keeps_the_new_known_good() {
    let home = TestHome::new();
    let hv = vmci::InMemoryHypervisor::new().with_vm(
        pool_vm(VM).snapshots(chain(&[BASE_SNAPSHOT, "update_1", "update_2", "update_3"])),
    );
    hv.inject_fault(VM, Fault::RemoveSnapshot);
    let runner = home.runner(&hv);

    let save = RunConfig::save("4.2").with_snapshot(Some("update_3".into()));
    let RunReport::Save(report) = runner.execute(&save).await.unwrap() else {
        panic!("expected a save report");
    };

    assert!(report.is_success());
    assert_eq!(report.saved.len(), 1);
    let saved = &report.saved[0];
    assert!(saved.pruned.is_empty());

    let vm = hv.list_vms().await.unwrap().remove(0);
    assert_eq!(
        runner.snapshots().known_good(&vm).unwrap().as_deref(),
        Some(saved.snapshot.as_str())
    );
    assert_eq!(hv.count_calls(|c| matches!(c, Call::PowerOff(_))), 0);
}
