//! Shared fixtures for vmci integration tests: snapshot trees, scripted pool
//! members and throwaway home directories.

use chrono::{Duration, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use vmci::hypervisor::SnapshotId;
use vmci::hypervisor::memory::{MemoryVm, ProgramScript};
use vmci::{HomeLayout, InMemoryHypervisor, Runner, RunnerOptions, SnapshotNode};

/// Name of the root snapshot every [`pool_vm`] carries.
pub const BASE_SNAPSHOT: &str = "clean";

/// Guest path of the entry point used by the default options.
pub const ENTRYPOINT: &str = "/usr/bin/qvm-run";

/// Snapshot node with a creation time `minutes` after a fixed epoch.
pub fn snapshot(name: &str, minutes: i64, children: Vec<SnapshotNode>) -> SnapshotNode {
    let epoch = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    SnapshotNode {
        id: SnapshotId::new(format!("snap-{name}")),
        name: name.to_string(),
        description: String::new(),
        created_at: epoch + Duration::minutes(minutes),
        children,
    }
}

/// A linear chain `names[0] -> names[1] -> ...`, returned as its root.
pub fn chain(names: &[&str]) -> Vec<SnapshotNode> {
    let mut node: Option<SnapshotNode> = None;
    for (i, name) in names.iter().enumerate().rev() {
        let children = node.take().into_iter().collect();
        node = Some(snapshot(name, i as i64, children));
    }
    node.into_iter().collect()
}

/// Entry point that writes the log file announced in the marker file, the way
/// the in-guest harness does.
pub fn log_writing_entrypoint(contents: &'static str) -> ProgramScript {
    ProgramScript::new(ENTRYPOINT).on_start(move |files| {
        let name = files
            .get("/home/user/.logfile")
            .map(|b| String::from_utf8_lossy(b).trim().to_string());
        if let Some(name) = name {
            files.insert(format!("/home/user/{name}"), contents.as_bytes().to_vec());
        }
    })
}

/// Powered-off pool member with a `clean` root snapshot and a working guest.
pub fn pool_vm(name: &str) -> MemoryVm {
    MemoryVm::new(name)
        .snapshots(vec![snapshot(BASE_SNAPSHOT, 0, Vec::new())])
        .script(log_writing_entrypoint("ok\n"))
}

/// In-memory pool made of [`pool_vm`]s.
pub fn pool(names: &[&str]) -> InMemoryHypervisor {
    let hv = InMemoryHypervisor::new();
    for name in names {
        hv.add_vm(pool_vm(name));
    }
    hv
}

/// A temporary vmci home. Removed on drop.
pub struct TestHome {
    pub dir: TempDir,
    pub layout: HomeLayout,
}

impl TestHome {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp home");
        let layout = HomeLayout::new(dir.path().to_path_buf());
        Self { dir, layout }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn runner(&self, hv: &InMemoryHypervisor) -> Runner {
        self.runner_with(hv, RunnerOptions::default())
    }

    pub fn runner_with(&self, hv: &InMemoryHypervisor, options: RunnerOptions) -> Runner {
        Runner::new(Arc::new(hv.clone()), self.layout.clone(), options).expect("build runner")
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}
