#![allow(dead_code)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// A `vmci` invocation with its own throwaway home directory.
pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// Another command sharing this context's home.
    pub fn new_cmd(&self) -> Command {
        command_for(self.home.path())
    }

    pub fn home_path(&self) -> &Path {
        self.home.path()
    }

    /// Write `contents` as the runner options file and return its path.
    pub fn write_config(&self, contents: &str) -> PathBuf {
        let path = self.home.path().join("config.json");
        std::fs::write(&path, contents).expect("Failed to write config");
        path
    }
}

fn command_for(home: &Path) -> Command {
    let bin_path = env!("CARGO_BIN_EXE_vmci");
    let mut cmd = Command::new(bin_path);
    // You can override this with .timeout(Duration::from_secs(N))
    cmd.timeout(Duration::from_secs(60));
    cmd.env_remove("VMCI_HOME");
    cmd.env_remove("VMCI_HYPERVISOR_TOKEN");
    cmd.arg("--home").arg(home);
    cmd
}

pub fn vmci() -> TestContext {
    let home = TempDir::new().expect("Failed to create temp home");
    let cmd = command_for(home.path());
    TestContext { cmd, home }
}

/// Options pointing at a port nothing listens on.
pub const UNREACHABLE_CONFIG: &str = r#"{
    "hypervisor": { "endpoint": "http://127.0.0.1:9", "request_timeout_secs": 5 }
}"#;
