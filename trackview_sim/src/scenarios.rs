//! Scenarios exercised by the deterministic simulation.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// TV-001: Start, continuation, terminal for one identity
    SimpleTrail,

    /// TV-002: Object switches identity mid-track
    IdentityRollover,

    /// TV-003: Duplicates and late copies after a settled trail
    StaleFlood,

    /// TV-004: Identity abandoned behind an unconfirmed fix
    OrphanGhost,

    /// TV-005: Latest-only placeholders replaced by a history replay
    HistoryOverwrite,

    // ═══════════════════════════════════════════════════
    // LOAD SCENARIOS
    // ═══════════════════════════════════════════════════

    /// TV-006: Many chaotic stations for the whole run
    Storm,

    /// TV-007: Server stops talking, watchdog must close the channel
    SilentPeer,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SimpleTrail,
            ScenarioId::IdentityRollover,
            ScenarioId::StaleFlood,
            ScenarioId::OrphanGhost,
            ScenarioId::HistoryOverwrite,
            ScenarioId::Storm,
            ScenarioId::SilentPeer,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SimpleTrail => "simple_trail",
            ScenarioId::IdentityRollover => "identity_rollover",
            ScenarioId::StaleFlood => "stale_flood",
            ScenarioId::OrphanGhost => "orphan_ghost",
            ScenarioId::HistoryOverwrite => "history_overwrite",
            ScenarioId::Storm => "storm",
            ScenarioId::SilentPeer => "silent_peer",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SimpleTrail => "Three reports build one head and a 3-point trail",
            ScenarioId::IdentityRollover => "Identity switch demotes the old head",
            ScenarioId::StaleFlood => "Duplicates and older copies are rejected cleanly",
            ScenarioId::OrphanGhost => "Identity orphaned by an unconfirmed fix becomes a ghost",
            ScenarioId::HistoryOverwrite => "Placeholders are overwritten by replayed history",
            ScenarioId::Storm => "20 noisy stations with duplicates and rollover",
            ScenarioId::SilentPeer => "Heartbeats while the server talks, then a watchdog close",
        }
    }

    /// Returns true if this scenario runs for the configured duration.
    pub fn is_load(&self) -> bool {
        matches!(self, ScenarioId::Storm | ScenarioId::SilentPeer)
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
            "simple_trail" | "simpletrail" | "tv-001" => Ok(ScenarioId::SimpleTrail),
            "identity_rollover" | "identityrollover" | "rollover" | "tv-002" => {
                Ok(ScenarioId::IdentityRollover)
            }
            "stale_flood" | "staleflood" | "tv-003" => Ok(ScenarioId::StaleFlood),
            "orphan_ghost" | "orphanghost" | "ghost" | "tv-004" => Ok(ScenarioId::OrphanGhost),
            "history_overwrite" | "historyoverwrite" | "tv-005" => Ok(ScenarioId::HistoryOverwrite),
            "storm" | "tv-006" => Ok(ScenarioId::Storm),
            "silent_peer" | "silentpeer" | "tv-007" => Ok(ScenarioId::SilentPeer),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("TV-006".parse::<ScenarioId>(), Ok(ScenarioId::Storm));
        assert_eq!("Ghost".parse::<ScenarioId>(), Ok(ScenarioId::OrphanGhost));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
