mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use cli::Cli;
use serde::Serialize;
use vmci::{RunMode, VmciError};

/// What stdout carries when a run fails before producing a report.
#[derive(Serialize)]
struct Failure<'a> {
    status: &'static str,
    error_kind: &'a str,
    error: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with 2 from here.
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let error_kind = e
                .downcast_ref::<VmciError>()
                .map(VmciError::kind)
                .unwrap_or("internal");
            let failure = Failure {
                status: "failure",
                error_kind,
                error: format!("{e:#}"),
            };
            if let Ok(json) = serde_json::to_string_pretty(&failure) {
                println!("{json}");
            }
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let layout = cli.global.layout();
    let _log_guard = vmci::init_logging_for(&layout)?;

    let runner = cli.global.create_runner(&layout)?;

    // First Ctrl-C cancels the run (the VM is still forced off), a second one exits.
    let token = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling pending waits");
            token.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let config = cli.run_config();
    match config.mode {
        RunMode::Ci(_) => commands::run::execute(&runner, &config).await,
        RunMode::Save => commands::save::execute(&runner, &config).await,
    }
}
