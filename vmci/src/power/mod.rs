//! Power state machine for leased VMs.

mod controller;
mod phase;

pub use controller::PowerController;
pub use phase::PowerPhase;
