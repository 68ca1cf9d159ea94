use chrono::NaiveDateTime;

/// Timestamp layout used in the log files.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// One sample tick: every sensor reading and valve state at `timestamp`.
///
/// Field order follows the rig the record was taken from and matches
/// [`Rig::log_header`](crate::rig::Rig::log_header).
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub pressures: Vec<f64>,
    pub temperatures: Vec<f64>,
    pub loads: Vec<f64>,
    pub valve_states: Vec<bool>,
}

impl LogRecord {
    pub fn to_row(&self) -> Vec<String> {
        let mut row = Vec::with_capacity(self.width());
        row.push(self.timestamp.format(TIMESTAMP_FORMAT).to_string());
        row.extend(
            self.pressures
                .iter()
                .chain(&self.temperatures)
                .chain(&self.loads)
                .map(|v| v.to_string()),
        );
        row.extend(self.valve_states.iter().map(|open| open.to_string()));
        row
    }

    pub fn width(&self) -> usize {
        1 + self.pressures.len() + self.temperatures.len() + self.loads.len() + self.valve_states.len()
    }
}
