//! Localization scenarios run by the simulator.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Plain marker handshake against a scripted peer
    Handshake,

    /// Caller cancels before the peer assigns an id
    CancelBeforeAssign,

    /// CoordinateFound with no live session is dropped
    StaleFound,

    /// A second localize call supersedes the first
    Supersede,

    /// Reset clears state and localizes again
    Reset,

    /// Two managers over a chunked, high-latency link
    ChoppyLink,

    /// Peer drops mid-handshake, then reconnects
    PeerDisconnect,

    /// Two managers localize each other with the simulated localizer
    TwoManagers,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Handshake,
            ScenarioId::CancelBeforeAssign,
            ScenarioId::StaleFound,
            ScenarioId::Supersede,
            ScenarioId::Reset,
            ScenarioId::ChoppyLink,
            ScenarioId::PeerDisconnect,
            ScenarioId::TwoManagers,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Handshake => "handshake",
            ScenarioId::CancelBeforeAssign => "cancel_before_assign",
            ScenarioId::StaleFound => "stale_found",
            ScenarioId::Supersede => "supersede",
            ScenarioId::Reset => "reset",
            ScenarioId::ChoppyLink => "choppy_link",
            ScenarioId::PeerDisconnect => "peer_disconnect",
            ScenarioId::TwoManagers => "two_managers",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Handshake => "Responder asks, peer assigns \"0\", both resolve the marker",
            ScenarioId::CancelBeforeAssign => "Cancellation before CoordinateAssigned returns not-localized",
            ScenarioId::StaleFound => "Stray CoordinateFound is dropped; the next handshake still succeeds",
            ScenarioId::Supersede => "Second localize cancels the first before its own handshake",
            ScenarioId::Reset => "Reset discards coordinates and runs a fresh handshake",
            ScenarioId::ChoppyLink => "Manager-to-manager marker handshake over 3-byte chunks and 40ms latency",
            ScenarioId::PeerDisconnect => "Link severed mid-handshake; reconnect and localize again",
            ScenarioId::TwoManagers => "Local and remote simulated localization run concurrently",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "handshake" | "a" => Ok(ScenarioId::Handshake),
            "cancel_before_assign" | "cancel" | "b" => Ok(ScenarioId::CancelBeforeAssign),
            "stale_found" | "c" => Ok(ScenarioId::StaleFound),
            "supersede" | "d" => Ok(ScenarioId::Supersede),
            "reset" => Ok(ScenarioId::Reset),
            "choppy_link" | "choppy" => Ok(ScenarioId::ChoppyLink),
            "peer_disconnect" | "disconnect" => Ok(ScenarioId::PeerDisconnect),
            "two_managers" => Ok(ScenarioId::TwoManagers),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("B".parse::<ScenarioId>(), Ok(ScenarioId::CancelBeforeAssign));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_serializes_as_name() {
        let json = serde_json::to_string(&ScenarioId::CancelBeforeAssign).unwrap();
        assert_eq!(json, "\"cancel_before_assign\"");
    }
}
