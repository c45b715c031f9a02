//! vmci: run CI inside disposable VMs leased from a hypervisor pool.
//!
//! A run leases an idle VM matching a platform version, reverts it to its
//! known-good snapshot, boots it, drives the build inside the guest through
//! the hypervisor's guest-process API, pulls the log back out and powers the
//! VM off again. A save pass refreshes the known-good snapshots instead.
//!
//! ```no_run
//! # async fn demo() -> vmci::VmciResult<()> {
//! use std::sync::Arc;
//! use vmci::{HomeLayout, InMemoryHypervisor, RunConfig, Runner, RunnerOptions, TriggerContext};
//!
//! let layout = HomeLayout::new(vmci::default_home_dir());
//! let options = RunnerOptions::load(&layout, None)?;
//! let runner = Runner::new(Arc::new(InMemoryHypervisor::new()), layout, options)?;
//! let config = RunConfig::ci("4.2", TriggerContext::manual("abc123")?);
//! let report = runner.execute(&config).await?;
//! # let _ = report;
//! # Ok(())
//! # }
//! ```

pub mod guest;
pub mod hypervisor;
pub mod pool;
pub mod power;
pub mod runner;
pub mod runtime;
pub mod snapshot;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub use guest::{CommandChannel, ExitStatus, GuestCommand, WaitMode};
#[cfg(feature = "rest")]
pub use hypervisor::http::HttpHypervisor;
pub use hypervisor::{Hypervisor, InMemoryHypervisor, PowerState, SnapshotNode, VmId, VmInfo};
pub use pool::{Lease, LeaseTable, PoolScheduler};
pub use power::{PowerController, PowerPhase};
pub use runner::{
    RunConfig, RunContext, RunMode, RunOutcome, RunReport, Runner, SaveReport, TriggerContext,
};
pub use runtime::{HomeLayout, RunnerOptions, Timings, default_home_dir};
pub use snapshot::{KnownGoodIndex, RetentionPolicy, SnapshotManager};
pub use vmci_shared::errors::{VmciError, VmciResult};

/// Initialize tracing for a runner using `layout`.
///
/// Human-readable output goes to stderr; the same events are appended to a
/// daily-rotated `vmci.log` under the logs directory. `RUST_LOG` overrides the
/// default `info` filter. The returned guard flushes the file writer on drop
/// and must be kept alive for the duration of the process.
pub fn init_logging_for(layout: &HomeLayout) -> VmciResult<WorkerGuard> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        VmciError::Storage(format!(
            "failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, "vmci.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| VmciError::Config(format!("invalid log filter: {e}")))?;

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_ansi(false),
        )
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();

    Ok(guard)
}
