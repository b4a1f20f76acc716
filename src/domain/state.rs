use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single leg order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegState {
    /// Accepted into a position, nothing sent yet
    Pending,
    /// Order live on the exchange
    Submitted,
    /// Fully filled
    Filled,
    /// Retry budget exhausted with only part of the quantity traded
    PartiallyFilled,
    /// Retry budget exhausted without a fill
    Unfilled,
    /// Left with exposure that needs an operator: a flatten gave up, or an
    /// order could not be confirmed dead
    Failed,
}

impl LegState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegState::Pending => "PENDING",
            LegState::Submitted => "SUBMITTED",
            LegState::Filled => "FILLED",
            LegState::PartiallyFilled => "PARTIALLY_FILLED",
            LegState::Unfilled => "UNFILLED",
            LegState::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, target: LegState) -> bool {
        use LegState::*;

        match (self, target) {
            (Pending, Submitted) => true,
            (Pending, Unfilled) => true, // no price, never sent

            (Submitted, Submitted) => true, // retry after cancel
            (Submitted, Filled) => true,
            (Submitted, PartiallyFilled) => true,
            (Submitted, Unfilled) => true,
            (Submitted, Failed) => true, // order may still be live

            (Filled, Failed) => true, // compensating close gave up
            (PartiallyFilled, Failed) => true,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LegState::Filled | LegState::PartiallyFilled | LegState::Unfilled | LegState::Failed
        )
    }
}

impl fmt::Display for LegState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Condor position lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    /// Legs are being executed
    Building,
    /// All four legs filled, watched by the exit monitor
    Open,
    /// Closing orders in flight
    Closing,
    /// Flat on the exchange
    Closed,
    /// Build failed and was rolled back
    Aborted,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Building => "BUILDING",
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::Closed => "CLOSED",
            PositionState::Aborted => "ABORTED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: PositionState) -> bool {
        use PositionState::*;

        match (self, target) {
            // From Building
            (Building, Open) => true,    // all legs filled
            (Building, Aborted) => true, // leg unfilled, rolled back

            // From Open
            (Open, Closing) => true,

            // From Closing
            (Closing, Closed) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<PositionState> {
        use PositionState::*;

        match self {
            Building => vec![Open, Aborted],
            Open => vec![Closing],
            Closing => vec![Closed],
            Closed => vec![],
            Aborted => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Aborted)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PositionState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "BUILDING" => Ok(PositionState::Building),
            "OPEN" => Ok(PositionState::Open),
            "CLOSING" => Ok(PositionState::Closing),
            "CLOSED" => Ok(PositionState::Closed),
            "ABORTED" => Ok(PositionState::Aborted),
            _ => Err(format!("Unknown position state: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_position_transitions() {
        assert!(PositionState::Building.can_transition_to(PositionState::Open));
        assert!(PositionState::Building.can_transition_to(PositionState::Aborted));
        assert!(PositionState::Open.can_transition_to(PositionState::Closing));
        assert!(PositionState::Closing.can_transition_to(PositionState::Closed));
    }

    #[test]
    fn test_invalid_position_transitions() {
        assert!(!PositionState::Open.can_transition_to(PositionState::Building));
        assert!(!PositionState::Aborted.can_transition_to(PositionState::Open));
        assert!(!PositionState::Closed.can_transition_to(PositionState::Open));
        assert!(!PositionState::Building.can_transition_to(PositionState::Closed));
    }

    #[test]
    fn test_valid_transitions_agree_with_predicate() {
        for state in [
            PositionState::Building,
            PositionState::Open,
            PositionState::Closing,
            PositionState::Closed,
            PositionState::Aborted,
        ] {
            for next in state.valid_transitions() {
                assert!(state.can_transition_to(next), "{state} -> {next}");
            }
        }
    }

    #[test]
    fn test_leg_transitions() {
        assert!(LegState::Pending.can_transition_to(LegState::Submitted));
        assert!(LegState::Submitted.can_transition_to(LegState::Filled));
        assert!(LegState::Filled.can_transition_to(LegState::Failed));
        assert!(LegState::Submitted.can_transition_to(LegState::PartiallyFilled));
        assert!(LegState::PartiallyFilled.can_transition_to(LegState::Failed));
        assert!(!LegState::PartiallyFilled.can_transition_to(LegState::Filled));
        assert!(!LegState::Unfilled.can_transition_to(LegState::Failed));
        assert!(!LegState::Unfilled.can_transition_to(LegState::Filled));
        assert!(!LegState::Filled.can_transition_to(LegState::Pending));
    }

    #[test]
    fn test_state_string_roundtrip() {
        assert_eq!(PositionState::try_from("open"), Ok(PositionState::Open));
        assert!(PositionState::try_from("halfway").is_err());
    }
}
