//! Trigger input and per-run context.

use chrono::{DateTime, Duration as ChronoDuration, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use vmci_shared::constants::reasons;
use vmci_shared::errors::{VmciError, VmciResult};

fn default_reason() -> String {
    reasons::MANUAL.to_string()
}

/// What triggered a CI run, as handed over by the webhook or nightly job.
///
/// Copied into the guest verbatim, unknown fields included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub commit: String,

    /// Trigger category, e.g. `push`, `nightly`, `manual`.
    #[serde(default = "default_reason")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TriggerContext {
    /// Context for a run started by hand for `commit`.
    pub fn manual(commit: impl Into<String>) -> VmciResult<Self> {
        let context = Self {
            commit: commit.into(),
            reason: default_reason(),
            author: None,
            message: None,
            extra: Map::new(),
        };
        context.validate()?;
        Ok(context)
    }

    /// Parse the `--context` JSON document.
    pub fn from_json(json: &str) -> VmciResult<Self> {
        let context: Self = serde_json::from_str(json)
            .map_err(|e| VmciError::InvalidArgument(format!("invalid context JSON: {e}")))?;
        context.validate()?;
        Ok(context)
    }

    /// The commit ends up in a file name, so it must be a plain token.
    fn validate(&self) -> VmciResult<()> {
        if self.commit.is_empty() {
            return Err(VmciError::InvalidArgument("commit must not be empty".into()));
        }
        if self
            .commit
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
        {
            return Err(VmciError::InvalidArgument(format!(
                "commit '{}' contains path separators or whitespace",
                self.commit
            )));
        }
        Ok(())
    }
}

/// Immutable facts about one CI run.
///
/// `started_at` is taken when orchestration begins, before a VM is leased;
/// the log file name derives from it.
#[derive(Clone, Debug, Serialize)]
pub struct RunContext {
    pub commit: String,
    pub reason: String,
    pub version: String,
    pub vm_name: String,
    pub snapshot: String,
    pub log_file: String,
    pub started_at: DateTime<Local>,
    /// When the in-guest watchdog powers the VM off, counted from its last arming.
    pub deadline: DateTime<Local>,
}

impl RunContext {
    pub fn new(
        trigger: &TriggerContext,
        version: &str,
        vm_name: &str,
        snapshot: &str,
        started_at: DateTime<Local>,
        deadline: DateTime<Local>,
    ) -> Self {
        Self {
            commit: trigger.commit.clone(),
            reason: trigger.reason.clone(),
            version: version.to_string(),
            vm_name: vm_name.to_string(),
            snapshot: snapshot.to_string(),
            log_file: log_file_name(started_at, &trigger.commit, vm_name, snapshot),
            started_at,
            deadline,
        }
    }

    /// Time left until the watchdog fires, zero once it has passed.
    pub fn remaining(&self, now: DateTime<Local>) -> Duration {
        (self.deadline - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Moment a watchdog armed at `armed_at` fires.
pub fn watchdog_deadline(armed_at: DateTime<Local>, watchdog: Duration) -> DateTime<Local> {
    armed_at + ChronoDuration::seconds(watchdog.as_secs() as i64)
}

/// `{date}-{time+micros}-{commit}-{vm}-{snapshot}.log.txt`, spaces in the
/// snapshot name replaced by dashes.
pub fn log_file_name(
    started_at: DateTime<Local>,
    commit: &str,
    vm_name: &str,
    snapshot: &str,
) -> String {
    format!(
        "{}-{}-{}-{}-{}.log.txt",
        started_at.format("%Y-%m-%d"),
        started_at.format("%H%M%S%6f"),
        commit,
        vm_name,
        snapshot.replace(' ', "-")
    )
}
