//! Configuration for the vmci runner.
//!
//! Loaded from `<home>/config.json`. Every field has a default, so an absent
//! file or a partial one is fine.

use super::layout::HomeLayout;
use super::types::Seconds;
use crate::guest::{GuestCommand, WaitMode};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vmci_shared::constants::{envs, filenames};
use vmci_shared::errors::{VmciError, VmciResult};

/// Default home directory: `$VMCI_HOME`, else `~/.vmci`.
pub fn default_home_dir() -> PathBuf {
    std::env::var(envs::VMCI_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(filenames::HOME_DIR);
            path
        })
}

// ============================================================================
// Hypervisor
// ============================================================================

/// How to reach the control plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorOptions {
    /// Base URL of the control-plane bridge.
    pub endpoint: String,

    /// Timeout for inventory queries, process polling and file transfers.
    pub request_timeout_secs: u64,

    /// Timeout for calls that return only once the host has finished the
    /// work: power on, snapshot revert, create and remove.
    pub task_timeout_secs: u64,

    /// Bearer token. `VMCI_HYPERVISOR_TOKEN` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for HypervisorOptions {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8697".to_string(),
            request_timeout_secs: 60,
            task_timeout_secs: 60 * 60,
            token: None,
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Placed in front of the version tag when matching VM names:
    /// `Qubes_` + `4.2` matches `Qubes_4.2-A`.
    pub name_prefix: String,

    /// Lifetime of a lease record. A crashed runner's lease becomes
    /// reclaimable after this long.
    pub lease_ttl: Seconds,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            name_prefix: "Qubes_".to_string(),
            lease_ttl: Seconds::from_hours(3),
        }
    }
}

// ============================================================================
// Timings
// ============================================================================

/// Every interval and budget the runner waits on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Interval between process listings while a blocking command runs.
    pub command_poll_interval: Seconds,

    /// Delay before the single sample of a fire-and-forget command.
    pub command_settle: Seconds,

    /// Upper bound on one blocking command. `null` waits forever.
    pub command_max_wait: Option<Seconds>,

    /// Readiness polls after power-on before giving up.
    pub boot_attempts: u32,

    pub boot_poll_interval: Seconds,

    /// Extra wait once the guest reports ready.
    pub boot_settle: Seconds,

    /// Wait between graceful shutdown and forced power-off.
    pub shutdown_grace: Seconds,

    /// Interval between pool scans while no VM is free.
    pub pool_poll_interval: Seconds,

    /// Overall scan window before giving up.
    pub pool_timeout: Seconds,

    /// In-guest self-shutdown delay. Whole minutes are used.
    pub watchdog: Seconds,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            command_poll_interval: Seconds::from_seconds(5),
            command_settle: Seconds::from_seconds(5),
            command_max_wait: Some(Seconds::from_minutes(110)),
            boot_attempts: 10,
            boot_poll_interval: Seconds::from_seconds(10),
            boot_settle: Seconds::from_seconds(60),
            shutdown_grace: Seconds::from_seconds(30),
            pool_poll_interval: Seconds::from_seconds(60),
            pool_timeout: Seconds::from_hours(2),
            watchdog: Seconds::from_minutes(110),
        }
    }
}

impl Timings {
    fn validate(&self) -> VmciResult<()> {
        if self.boot_attempts == 0 {
            return Err(VmciError::Config(
                "timings.boot_attempts must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("command_poll_interval", self.command_poll_interval),
            ("boot_poll_interval", self.boot_poll_interval),
            ("pool_poll_interval", self.pool_poll_interval),
        ] {
            if value.as_seconds() == 0 {
                return Err(VmciError::Config(format!("timings.{} must be non-zero", name)));
            }
        }
        if self.watchdog.as_minutes() == 0 {
            return Err(VmciError::Config(
                "timings.watchdog must be at least one minute".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Guest
// ============================================================================

/// A local file copied into the guest before the entry point runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub source: PathBuf,
    pub guest_path: String,
}

/// What happens inside the guest during a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestOptions {
    /// Home of the guest user; the log artifact is read from here.
    pub home: String,

    /// Where the trigger context JSON is written.
    pub context_path: String,

    /// Where the log file name is written, for the guest side to pick up.
    pub log_marker_path: String,

    /// Platform update chain, run when updates are requested.
    pub update_commands: Vec<GuestCommand>,

    /// Program used to arm the self-shutdown timer.
    pub watchdog_program: String,

    /// Shutdown binary handed to `watchdog_program`.
    pub shutdown_binary: String,

    pub staging: Vec<StagedFile>,

    /// Chain run after staging, before the entry point.
    pub post_stage_commands: Vec<GuestCommand>,

    /// Build/test entry point.
    pub entrypoint: GuestCommand,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            home: "/home/user".to_string(),
            context_path: "/home/user/context.json".to_string(),
            log_marker_path: "/home/user/.logfile".to_string(),
            update_commands: vec![
                GuestCommand::new("/usr/bin/sudo").args("/usr/bin/qubes-dom0-update"),
                GuestCommand::new("/usr/bin/sudo").args(
                    "/usr/bin/qubes-vm-update --show-output --no-progress --templates \
                     --standalones --force-update --apply-to-all --max-concurrency 4",
                ),
            ],
            watchdog_program: "/usr/bin/sudo".to_string(),
            shutdown_binary: "/usr/sbin/shutdown".to_string(),
            staging: Vec::new(),
            post_stage_commands: Vec::new(),
            entrypoint: GuestCommand::new("/usr/bin/qvm-run")
                .args("sd-dev /usr/bin/python3 /home/user/bin/begin.py")
                .wait(WaitMode::FireAndForget),
        }
    }
}

impl GuestOptions {
    /// Command that powers the guest off after `minutes`.
    pub fn watchdog_command(&self, minutes: u64) -> GuestCommand {
        GuestCommand::new(&self.watchdog_program)
            .args(format!("{} -h +{}", self.shutdown_binary, minutes))
            .wait(WaitMode::Blocking)
    }

    /// Guest path of a log artifact.
    pub fn log_path(&self, log_file: &str) -> String {
        format!("{}/{}", self.home.trim_end_matches('/'), log_file)
    }
}

// ============================================================================
// Runner Options
// ============================================================================

/// Everything the runner reads from `config.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    pub hypervisor: HypervisorOptions,
    pub pool: PoolOptions,
    pub timings: Timings,
    pub guest: GuestOptions,

    /// Where pulled log artifacts land. Defaults to `<home>/reports`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports_dir: Option<PathBuf>,
}

impl RunnerOptions {
    /// Load options from `path`, or `<home>/config.json` when `path` is `None`.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is an
    /// error. The token environment variable is applied last.
    pub fn load(layout: &HomeLayout, path: Option<&Path>) -> VmciResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| layout.config_file());

        let mut options = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str::<Self>(&contents).map_err(|e| {
                VmciError::Config(format!("invalid config {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(VmciError::Config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        if let Ok(token) = std::env::var(envs::HYPERVISOR_TOKEN)
            && !token.is_empty()
        {
            options.hypervisor.token = Some(token);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> VmciResult<()> {
        self.timings.validate()?;
        if self.guest.entrypoint.program.is_empty() {
            return Err(VmciError::Config("guest.entrypoint.program is empty".into()));
        }
        Ok(())
    }

    pub fn reports_dir(&self, layout: &HomeLayout) -> PathBuf {
        self.reports_dir
            .clone()
            .unwrap_or_else(|| layout.reports_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let layout = HomeLayout::new(temp.path().to_path_buf());

        let options = RunnerOptions::load(&layout, None).unwrap();

        assert_eq!(options.pool.name_prefix, "Qubes_");
        assert_eq!(options.timings, Timings::default());
        assert_eq!(options.reports_dir(&layout), temp.path().join("reports"));
    }

    #[test]
    fn test_partial_config_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let layout = HomeLayout::new(temp.path().to_path_buf());
        std::fs::write(
            layout.config_file(),
            r#"{"pool":{"name_prefix":"Platform_"},"timings":{"pool_timeout":3600}}"#,
        )
        .unwrap();

        let options = RunnerOptions::load(&layout, None).unwrap();

        assert_eq!(options.pool.name_prefix, "Platform_");
        assert_eq!(options.pool.lease_ttl, Seconds::from_hours(3));
        assert_eq!(options.timings.pool_timeout, Seconds::from_hours(1));
        assert_eq!(options.timings.boot_attempts, 10);
    }

    #[test]
    fn test_malformed_config_is_config_error() {
        let temp = TempDir::new().unwrap();
        let layout = HomeLayout::new(temp.path().to_path_buf());
        let path = temp.path().join("custom.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = RunnerOptions::load(&layout, Some(&path)).unwrap_err();
        assert!(matches!(err, VmciError::Config(_)));
    }

    #[test]
    fn test_zero_boot_attempts_rejected() {
        let mut options = RunnerOptions::default();
        options.timings.boot_attempts = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_watchdog_command() {
        let guest = GuestOptions::default();
        let cmd = guest.watchdog_command(110);
        assert_eq!(cmd.program, "/usr/bin/sudo");
        assert_eq!(cmd.args, "/usr/sbin/shutdown -h +110");
        assert_eq!(guest.log_path("run.log.txt"), "/home/user/run.log.txt");
    }
}
