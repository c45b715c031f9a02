//! Guest command description and its result.

use crate::hypervisor::ProgramSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the caller waits for a guest command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Poll the process list until an exit code shows up.
    #[default]
    Blocking,
    /// Sample once after the settle delay; anything but a failure code counts
    /// as success.
    FireAndForget,
}

/// Command builder for programs run inside a guest.
///
/// Arguments are a single string: the control plane hands it to the guest
/// verbatim, shell-style quoting included.
///
/// # Examples
///
/// ```
/// use vmci::guest::{GuestCommand, WaitMode};
///
/// let cmd = GuestCommand::new("/usr/bin/sudo")
///     .args("/usr/sbin/shutdown -h +110")
///     .wait(WaitMode::FireAndForget);
/// assert_eq!(cmd.to_string(), "/usr/bin/sudo /usr/sbin/shutdown -h +110");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCommand {
    pub program: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub wait: WaitMode,
}

impl GuestCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: String::new(),
            wait: WaitMode::Blocking,
        }
    }

    /// Set the argument string.
    pub fn args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    pub fn wait(mut self, wait: WaitMode) -> Self {
        self.wait = wait;
        self
    }

    pub(crate) fn program_spec(&self) -> ProgramSpec {
        ProgramSpec {
            program_path: self.program.clone(),
            arguments: self.args.clone(),
        }
    }
}

impl fmt::Display for GuestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            f.write_str(&self.program)
        } else {
            write!(f, "{} {}", self.program, self.args)
        }
    }
}

/// Outcome of a guest command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub pid: i64,
    /// `None` when a fire-and-forget command was still running at sample time.
    pub exit_code: Option<i64>,
}

impl ExitStatus {
    /// True unless a failure code was observed.
    pub fn success(&self) -> bool {
        !matches!(self.exit_code, Some(code) if code > 0)
    }

    /// Whether an exit code was actually observed.
    pub fn is_confirmed(&self) -> bool {
        self.exit_code.is_some()
    }
}
