use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Args, Parser};
use vmci::{HomeLayout, HttpHypervisor, RunConfig, Runner, RunnerOptions, TriggerContext};

/// Lease a VM for a platform version and run CI in it, or refresh the
/// known-good snapshots of the pool.
#[derive(Parser, Debug)]
#[command(name = "vmci", author, about, disable_version_flag = true)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["context", "commit", "save"])
))]
pub struct Cli {
    /// Platform version tag, e.g. 4.2
    #[arg(long = "version", id = "platform", value_name = "TAG", value_parser = parse_version)]
    pub platform: String,

    /// Trigger context as a JSON document (requires "commit")
    #[arg(long, value_name = "JSON", value_parser = parse_context)]
    pub context: Option<TriggerContext>,

    /// Run CI for this commit by hand
    #[arg(long, value_name = "SHA", value_parser = parse_commit)]
    pub commit: Option<TriggerContext>,

    /// Refresh the known-good snapshot of every idle VM instead of running CI
    #[arg(long)]
    pub save: bool,

    /// Start from this snapshot instead of the recorded known-good one
    #[arg(long, value_name = "NAME")]
    pub snapshot: Option<String>,

    /// Apply platform updates first
    #[arg(long)]
    pub update: bool,

    #[command(flatten)]
    pub global: GlobalFlags,
}

impl Cli {
    pub fn run_config(&self) -> RunConfig {
        let config = match self.context.clone().or_else(|| self.commit.clone()) {
            Some(trigger) => RunConfig::ci(&self.platform, trigger),
            None => RunConfig::save(&self.platform),
        };
        config
            .with_snapshot(self.snapshot.clone())
            .with_update(self.update)
    }
}

#[derive(Args, Debug, Clone)]
pub struct GlobalFlags {
    /// State directory (default: ~/.vmci)
    #[arg(long, env = "VMCI_HOME", value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Runner options file (default: <home>/config.json)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl GlobalFlags {
    pub fn layout(&self) -> HomeLayout {
        HomeLayout::new(self.home.clone().unwrap_or_else(vmci::default_home_dir))
    }

    pub fn create_runner(&self, layout: &HomeLayout) -> anyhow::Result<Runner> {
        let options = RunnerOptions::load(layout, self.config.as_deref())?;
        let hypervisor = HttpHypervisor::new(&options.hypervisor)
            .context("Failed to set up hypervisor client")?;
        let runner = Runner::new(Arc::new(hypervisor), layout.clone(), options)?;
        Ok(runner)
    }
}

fn parse_version(tag: &str) -> Result<String, String> {
    vmci::pool::validate_version(tag)
        .map(|_| tag.to_string())
        .map_err(|e| e.to_string())
}

fn parse_context(json: &str) -> Result<TriggerContext, String> {
    TriggerContext::from_json(json).map_err(|e| e.to_string())
}

fn parse_commit(commit: &str) -> Result<TriggerContext, String> {
    TriggerContext::manual(commit).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_modes_are_exclusive() {
        let err = Cli::try_parse_from(["vmci", "--version", "4.2", "--commit", "abc", "--save"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);

        let err = Cli::try_parse_from(["vmci", "--version", "4.2"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_run_config_from_flags() {
        let cli = Cli::try_parse_from([
            "vmci", "--version", "4.2", "--commit", "abc123", "--snapshot", "clean", "--update",
        ])
        .unwrap();
        let config = cli.run_config();

        assert_eq!(config.version, "4.2");
        assert_eq!(config.snapshot.as_deref(), Some("clean"));
        assert!(config.update);
        match config.mode {
            vmci::RunMode::Ci(trigger) => {
                assert_eq!(trigger.commit, "abc123");
                assert_eq!(trigger.reason, "manual");
            }
            vmci::RunMode::Save => panic!("expected CI mode"),
        }
    }

    #[test]
    fn test_save_mode() {
        let cli = Cli::try_parse_from(["vmci", "--version", "4.1", "--save"]).unwrap();
        assert!(matches!(cli.run_config().mode, vmci::RunMode::Save));
    }
}
