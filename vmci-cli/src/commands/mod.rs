pub mod run;
pub mod save;

use serde::Serialize;

/// Write `value` to stdout as pretty JSON.
pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
