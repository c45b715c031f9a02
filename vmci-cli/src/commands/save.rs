use std::process::ExitCode;

use vmci::{RunConfig, RunReport, Runner};

/// Save mode: refresh every idle VM, then report per VM.
///
/// Exits non-zero if any VM failed, after printing the full report.
pub async fn execute(runner: &Runner, config: &RunConfig) -> anyhow::Result<ExitCode> {
    let report = runner.execute(config).await?;
    let RunReport::Save(summary) = &report else {
        anyhow::bail!("save pass produced a CI outcome");
    };

    for failure in &summary.failed {
        eprintln!("Error saving '{}': {}", failure.vm, failure.error);
    }
    tracing::info!(
        saved = summary.saved.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        "Save pass finished"
    );

    super::print_json(&report)?;
    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
