//! vmci shared - error taxonomy and constants
//!
//! Used by both the `vmci` library and the `vmci` command-line tool.

pub mod constants;
pub mod errors;

pub use errors::{VmciError, VmciResult};
