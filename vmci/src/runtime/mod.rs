pub mod layout;
pub mod lock;
pub mod options;
pub mod types;

pub use layout::HomeLayout;
pub use options::{
    GuestOptions, HypervisorOptions, PoolOptions, RunnerOptions, StagedFile, Timings,
    default_home_dir,
};
pub use types::{HolderId, Seconds};
