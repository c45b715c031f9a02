//! Small value types shared across the runner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// DURATIONS
// ============================================================================

/// Whole seconds, as written in the config file.
///
/// Every interval and budget in [`Timings`](super::options::Timings) is a
/// `Seconds`, so `"pool_timeout": 7200` in JSON and `Seconds::from_hours(2)`
/// in code mean the same thing.
///
/// # Example
///
/// ```
/// use vmci::runtime::types::Seconds;
///
/// let watchdog = Seconds::from_minutes(110);
/// assert_eq!(watchdog.as_minutes(), 110);
/// assert_eq!(watchdog.as_duration().as_secs(), 6600);
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seconds(pub u64);

impl Seconds {
    #[inline]
    pub const fn from_seconds(s: u64) -> Self {
        Self(s)
    }

    #[inline]
    pub const fn from_minutes(m: u64) -> Self {
        Self(m * 60)
    }

    #[inline]
    pub const fn from_hours(h: u64) -> Self {
        Self(h * 60 * 60)
    }

    #[inline]
    pub const fn as_seconds(&self) -> u64 {
        self.0
    }

    /// Whole minutes (truncating).
    #[inline]
    pub const fn as_minutes(&self) -> u64 {
        self.0 / 60
    }

    #[inline]
    pub const fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl From<u64> for Seconds {
    fn from(s: u64) -> Self {
        Self(s)
    }
}

impl From<Seconds> for Duration {
    fn from(s: Seconds) -> Self {
        s.as_duration()
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 3600 && self.0.is_multiple_of(3600) {
            write!(f, "{} hours", self.0 / 3600)
        } else if self.0 >= 60 && self.0.is_multiple_of(60) {
            write!(f, "{} minutes", self.0 / 60)
        } else {
            write!(f, "{} seconds", self.0)
        }
    }
}

// ============================================================================
// HOLDER ID
// ============================================================================

/// Identity of one orchestrator invocation, recorded on the leases it holds.
///
/// ULID, so holders sort by start time in the lease file.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    /// Length of a holder id (26 chars = ULID format).
    pub const LENGTH: usize = 26;

    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Parse an existing holder id. Returns `None` unless it is a valid ULID.
    pub fn parse(s: &str) -> Option<Self> {
        ulid::Ulid::from_string(s).ok().map(|u| Self(u.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HolderId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_display() {
        assert_eq!(Seconds::from_hours(2).to_string(), "2 hours");
        assert_eq!(Seconds::from_minutes(110).to_string(), "110 minutes");
        assert_eq!(Seconds::from_seconds(90).to_string(), "90 seconds");
    }

    #[test]
    fn test_seconds_serde_transparent() {
        let json = serde_json::to_string(&Seconds::from_minutes(1)).unwrap();
        assert_eq!(json, "60");
        let parsed: Seconds = serde_json::from_str("7200").unwrap();
        assert_eq!(parsed, Seconds::from_hours(2));
    }

    #[test]
    fn test_holder_id_is_ulid() {
        let id = HolderId::new();
        assert_eq!(id.as_str().len(), HolderId::LENGTH);
        assert_eq!(HolderId::parse(id.as_str()), Some(id));
        assert!(HolderId::parse("not-a-ulid").is_none());
    }
}
