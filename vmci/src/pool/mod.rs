//! Resource pool scheduler and its lease table.

mod lease;
mod scheduler;

pub use lease::{Lease, LeaseRecord, LeaseTable};
pub use scheduler::{PoolScheduler, matches_version, validate_version};
