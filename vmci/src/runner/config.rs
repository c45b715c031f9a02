use super::context::TriggerContext;

/// What a runner invocation should do.
#[derive(Clone, Debug)]
pub enum RunMode {
    /// Lease one VM and run CI for this trigger.
    Ci(TriggerContext),
    /// Refresh the known-good snapshot of every idle VM.
    Save,
}

/// One runner invocation.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Platform version tag, e.g. `4.2`.
    pub version: String,
    /// Start from this snapshot instead of the recorded known-good one.
    pub snapshot: Option<String>,
    /// Apply platform updates before the work.
    pub update: bool,
    pub mode: RunMode,
}

impl RunConfig {
    pub fn ci(version: impl Into<String>, trigger: TriggerContext) -> Self {
        Self {
            version: version.into(),
            snapshot: None,
            update: false,
            mode: RunMode::Ci(trigger),
        }
    }

    pub fn save(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            snapshot: None,
            update: false,
            mode: RunMode::Save,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<String>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }
}
