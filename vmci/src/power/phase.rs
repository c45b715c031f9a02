use serde::{Deserialize, Serialize};

/// Where a leased VM is in its power lifecycle.
///
/// ```text
/// Off → PoweringOn → WaitingForGuest → Ready → ShuttingDown → Off
/// ```
///
/// Any phase can drop straight to `Off` through a forced power-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerPhase {
    Off,

    /// Power-on issued, not yet acknowledged.
    PoweringOn,

    /// Powered on, guest tools not answering yet.
    WaitingForGuest,

    /// Guest booted and accepting commands.
    Ready,

    /// Graceful shutdown requested.
    ShuttingDown,
}

impl PowerPhase {
    pub fn is_off(&self) -> bool {
        matches!(self, PowerPhase::Off)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, PowerPhase::Ready)
    }

    /// Check if transition to target phase is valid.
    pub fn can_transition_to(&self, target: PowerPhase) -> bool {
        use PowerPhase::*;
        matches!(
            (self, target),
            (Off, PoweringOn)
                | (PoweringOn, WaitingForGuest)
                | (WaitingForGuest, Ready)
                // Shutdown is attempted from any powered phase
                | (PoweringOn | WaitingForGuest | Ready, ShuttingDown)
                | (PoweringOn | WaitingForGuest | Ready | ShuttingDown, Off)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerPhase::Off => "off",
            PowerPhase::PoweringOn => "powering_on",
            PowerPhase::WaitingForGuest => "waiting_for_guest",
            PowerPhase::Ready => "ready",
            PowerPhase::ShuttingDown => "shutting_down",
        }
    }
}

impl std::str::FromStr for PowerPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(PowerPhase::Off),
            "powering_on" => Ok(PowerPhase::PoweringOn),
            "waiting_for_guest" => Ok(PowerPhase::WaitingForGuest),
            "ready" => Ok(PowerPhase::Ready),
            "shutting_down" => Ok(PowerPhase::ShuttingDown),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for PowerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use PowerPhase::*;
        let cycle = [Off, PoweringOn, WaitingForGuest, Ready, ShuttingDown, Off];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        use PowerPhase::*;
        assert!(!Off.can_transition_to(Ready));
        assert!(!Off.can_transition_to(Off));
        assert!(!Ready.can_transition_to(PoweringOn));
        assert!(!ShuttingDown.can_transition_to(Ready));
        assert!(WaitingForGuest.can_transition_to(Off));
    }

    #[test]
    fn test_parse() {
        assert_eq!("waiting_for_guest".parse(), Ok(PowerPhase::WaitingForGuest));
        assert_eq!(PowerPhase::ShuttingDown.to_string(), "shutting_down");
        assert!("booting".parse::<PowerPhase>().is_err());
    }
}
