use std::process::ExitCode;

use vmci::{RunConfig, RunReport, Runner};

/// CI mode: one run on one leased VM.
pub async fn execute(runner: &Runner, config: &RunConfig) -> anyhow::Result<ExitCode> {
    let report = runner.execute(config).await?;
    let RunReport::Ci(outcome) = &report else {
        anyhow::bail!("CI run produced a save report");
    };

    tracing::info!(
        vm = %outcome.vm,
        commit = %outcome.commit,
        report = %outcome.report_path.display(),
        "CI run finished"
    );
    super::print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}
