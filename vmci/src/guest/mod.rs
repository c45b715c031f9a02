//! Running programs inside a guest.

mod channel;
mod command;

pub use channel::CommandChannel;
pub use command::{ExitStatus, GuestCommand, WaitMode};
