use serde::Serialize;
use stand_core::{ConnectionStatus, SequencerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    High,
    Low,
}

impl Cadence {
    pub fn from_high(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }
}

/// Everything a control surface needs to render the stand.
#[derive(Debug, Clone, Serialize)]
pub struct StandStatus {
    pub connection: ConnectionStatus,
    pub sequencer: SequencerStatus,
    pub cadence: Cadence,
    pub log_file: String,
    pub samples_dropped: u64,
    pub open_valves: Vec<String>,
}
