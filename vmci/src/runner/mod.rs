//! Run orchestrator: CI runs and save passes.

mod config;
mod context;
mod core;
mod outcome;

pub use config::{RunConfig, RunMode};
pub use context::{RunContext, TriggerContext, log_file_name, watchdog_deadline};
pub use core::Runner;
pub use outcome::{RunOutcome, RunReport, SaveFailure, SaveReport, SavedSnapshot};
