//! Simulation scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// TRK-001: three streams of equal length align into rounds
    Barrier,

    /// TRK-002: one stream ends early, the others carry on
    Exhaustion,

    /// TRK-003: a consumer that never drains
    Backpressure,

    /// TRK-004: build, persist and draw a reference path from a captured lap
    ReferenceTrack,

    /// TRK-005: self-referential lap segmentation of a multi-lap stream
    LapSegmentation,

    /// TRK-006: flaky upstream and a broken viewer
    FlakyUpstream,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Barrier,
            ScenarioId::Exhaustion,
            ScenarioId::Backpressure,
            ScenarioId::ReferenceTrack,
            ScenarioId::LapSegmentation,
            ScenarioId::FlakyUpstream,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Barrier => "barrier",
            ScenarioId::Exhaustion => "exhaustion",
            ScenarioId::Backpressure => "backpressure",
            ScenarioId::ReferenceTrack => "reference_track",
            ScenarioId::LapSegmentation => "lap_segmentation",
            ScenarioId::FlakyUpstream => "flaky_upstream",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Barrier => "3 entities x 10 samples, expect 10 rounds and trails of min(r, 5)",
            ScenarioId::Exhaustion => "one stream closes after 4 samples, rounds 5-10 carry the others",
            ScenarioId::Backpressure => "undrained queue never exceeds capacity, fetcher stops promptly",
            ScenarioId::ReferenceTrack => "1.3 captured laps -> 144-point path matching the course length",
            ScenarioId::LapSegmentation => "3.5 laps segmented around the first sample",
            ScenarioId::FlakyUpstream => "30% fetch failures and a failing renderer, no sample lost",
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
            "barrier" | "trk-001" => Ok(ScenarioId::Barrier),
            "exhaustion" | "trk-002" => Ok(ScenarioId::Exhaustion),
            "backpressure" | "trk-003" => Ok(ScenarioId::Backpressure),
            "reference_track" | "referencetrack" | "trk-004" => Ok(ScenarioId::ReferenceTrack),
            "lap_segmentation" | "lapsegmentation" | "trk-005" => Ok(ScenarioId::LapSegmentation),
            "flaky_upstream" | "flakyupstream" | "trk-006" => Ok(ScenarioId::FlakyUpstream),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
