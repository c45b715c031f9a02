//! Snapshot manager and the known-good snapshot index.

mod index;
mod manager;

pub use index::{KnownGood, KnownGoodIndex};
pub use manager::{
    RetentionPolicy, SnapshotManager, find_in_tree, flatten, timestamped_name,
};
