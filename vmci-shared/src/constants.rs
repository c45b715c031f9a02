//! Constants shared by the library and the CLI.

/// Environment variables read by vmci.
pub mod envs {
    /// Overrides the default home directory (`~/.vmci`).
    pub const VMCI_HOME: &str = "VMCI_HOME";

    /// Bearer token passed to the hypervisor control plane.
    pub const HYPERVISOR_TOKEN: &str = "VMCI_HYPERVISOR_TOKEN";
}

/// Files under the home directory.
pub mod filenames {
    pub const HOME_DIR: &str = ".vmci";
    pub const CONFIG: &str = "config.json";
    pub const KNOWN_GOOD_INDEX: &str = "known_good.json";
    pub const LEASES: &str = "leases.json";
    pub const LEASES_LOCK: &str = "leases.lock";
    pub const LOGS_DIR: &str = "logs";
    pub const REPORTS_DIR: &str = "reports";
}

/// Snapshot naming.
pub mod snapshots {
    /// Prefix of snapshots written by the save pass.
    pub const UPDATE_PREFIX: &str = "update_";

    /// Number of save-pass snapshots kept per VM.
    pub const KEEP: usize = 3;
}

/// Run trigger categories.
pub mod reasons {
    pub const MANUAL: &str = "manual";
}
