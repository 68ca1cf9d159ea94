//! Sequence scripts: a limits section followed by timed events.
//!
//! ```text
//! Limits
//! PT-OX-01,PT-FU-01
//! 850,-1
//! Sequence
//! Timestamp (ms),SV-OX-01,SV-FU-01
//! 0,0,0
//! 500,1,0
//! 750,CHECKPSI,PT-OX-01,300
//! 1500,0,0
//! ```
//!
//! Times in the file are absolute milliseconds from script start; the parsed
//! events carry the delay from the previous event instead.

use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

pub type DeviceId = String;

pub const LIMITS_HEADER: &str = "Limits";
pub const SEQUENCE_HEADER: &str = "Sequence";
pub const CHECK_MARKER: &str = "CHECKPSI";
pub const NO_REDLINE: f64 = -1.0;

const DEFAULT_TIME_LABEL: &str = "Timestamp (ms)";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("failed to read script: {0}")]
    Read(String),

    #[error("missing `{0}` section header")]
    MissingSection(&'static str),

    #[error("limits list {devices} devices but {values} values")]
    MalformedLimits { devices: usize, values: usize },

    #[error("invalid redline `{value}` for {device}")]
    InvalidLimit { device: DeviceId, value: String },

    #[error("line {line}: expected {expected} columns, found {found}")]
    MalformedRow {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: invalid elapsed time `{value}`")]
    InvalidTimestamp { line: u64, value: String },

    #[error("line {line}: {elapsed_ms} ms is earlier than the previous event at {previous_ms} ms")]
    NonMonotonicTime {
        line: u64,
        elapsed_ms: u64,
        previous_ms: u64,
    },

    #[error("line {line}: invalid state `{value}` for {device}, expected 0 or 1")]
    InvalidState {
        line: u64,
        device: DeviceId,
        value: String,
    },

    #[error("line {line}: invalid minimum pressure `{value}`")]
    InvalidPressure { line: u64, value: String },

    #[error("first event must be at 0 ms, found {0} ms")]
    NonZeroStart(u64),

    #[error("first event must declare the initial state of every device")]
    MissingInitialState,

    #[error("script references unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("cannot replace the script while a run is active")]
    RunActive,
}

/// Redlines by device, in file order. `-1` entries are never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceLimits {
    entries: Vec<(DeviceId, f64)>,
}

impl DeviceLimits {
    pub fn get(&self, device: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == device)
            .map(|(_, limit)| *limit)
    }

    /// Set a redline; [`NO_REDLINE`] is ignored.
    pub fn insert(&mut self, device: impl Into<DeviceId>, redline: f64) {
        if redline == NO_REDLINE {
            return;
        }
        let device = device.into();
        match self.entries.iter_mut().find(|(name, _)| *name == device) {
            Some(entry) => entry.1 = redline,
            None => self.entries.push((device, redline)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(name, limit)| (name.as_str(), *limit))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Drive each listed device open (`true`) or closed (`false`).
    SetStates {
        delay_ms: u64,
        states: Vec<(DeviceId, bool)>,
    },
    /// Abort unless `device` reads at least `min_psi`.
    CheckPressure {
        delay_ms: u64,
        device: DeviceId,
        min_psi: f64,
    },
}

impl Event {
    /// Milliseconds after the previous event.
    pub fn delay_ms(&self) -> u64 {
        match self {
            Event::SetStates { delay_ms, .. } | Event::CheckPressure { delay_ms, .. } => *delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    limits: DeviceLimits,
    time_label: String,
    devices: Vec<DeviceId>,
    events: Vec<Event>,
}

impl Script {
    pub fn new(limits: DeviceLimits, devices: Vec<DeviceId>, events: Vec<Event>) -> Self {
        Self {
            limits,
            time_label: DEFAULT_TIME_LABEL.to_string(),
            devices,
            events,
        }
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Controlled devices, in column order.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Absolute time of each event from script start.
    pub fn offsets_ms(&self) -> Vec<u64> {
        self.events
            .iter()
            .scan(0u64, |at, event| {
                *at += event.delay_ms();
                Some(*at)
            })
            .collect()
    }

    pub fn from_path(path: &Path) -> Result<Self, ScriptError> {
        let file = File::open(path).map_err(|e| ScriptError::Read(format!("{}: {e}", path.display())))?;
        Self::parse(file)
    }

    pub fn parse_str(source: &str) -> Result<Self, ScriptError> {
        Self::parse(source.as_bytes())
    }

    pub fn parse<R: Read>(reader: R) -> Result<Self, ScriptError> {
        let mut csv = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let mut rows = Vec::new();
        for record in csv.records() {
            let record = record.map_err(|e| ScriptError::Read(e.to_string()))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            let line = record.position().map_or(0, |p| p.line());
            rows.push((line, record));
        }
        let mut rows = rows.into_iter().peekable();

        match rows.next() {
            Some((_, row)) if row.get(0) == Some(LIMITS_HEADER) => {}
            _ => return Err(ScriptError::MissingSection(LIMITS_HEADER)),
        }

        let mut limits = DeviceLimits::default();
        let limits_present = rows
            .peek()
            .is_some_and(|(_, row)| row.get(0) != Some(SEQUENCE_HEADER));
        if limits_present {
            let (_, names) = rows.next().ok_or(ScriptError::MissingSection(SEQUENCE_HEADER))?;
            let values = rows.next().map(|(_, row)| row).unwrap_or_default();
            if names.len() != values.len() {
                return Err(ScriptError::MalformedLimits {
                    devices: names.len(),
                    values: values.len(),
                });
            }
            for (device, value) in names.iter().zip(values.iter()) {
                let redline = value.parse::<f64>().map_err(|_| ScriptError::InvalidLimit {
                    device: device.to_string(),
                    value: value.to_string(),
                })?;
                if redline == NO_REDLINE {
                    log::debug!("No redline for {device}");
                }
                limits.insert(device, redline);
            }
        }

        match rows.next() {
            Some((_, row)) if row.get(0) == Some(SEQUENCE_HEADER) => {}
            _ => return Err(ScriptError::MissingSection(SEQUENCE_HEADER)),
        }

        let Some((_, header)) = rows.next() else {
            log::warn!("Script has no sequence data");
            return Ok(Self::new(limits, Vec::new(), Vec::new()));
        };
        let time_label = header.get(0).unwrap_or(DEFAULT_TIME_LABEL).to_string();
        let devices: Vec<DeviceId> = header.iter().skip(1).map(str::to_string).collect();

        let mut events = Vec::new();
        let mut previous_ms = 0u64;
        for (line, row) in rows {
            let (elapsed_ms, event) = parse_event(line, &row, &devices, previous_ms)?;
            if events.is_empty() {
                if elapsed_ms != 0 {
                    return Err(ScriptError::NonZeroStart(elapsed_ms));
                }
                if !matches!(event, Event::SetStates { .. }) {
                    return Err(ScriptError::MissingInitialState);
                }
            }
            previous_ms = elapsed_ms;
            events.push(event);
        }

        Ok(Self {
            limits,
            time_label,
            devices,
            events,
        })
    }

    /// Write the script back out in the same two-section layout.
    pub fn to_csv<W: Write>(&self, writer: W) -> Result<(), ScriptError> {
        let mut csv = WriterBuilder::new().flexible(true).from_writer(writer);
        let io = |e: csv::Error| ScriptError::Read(e.to_string());

        csv.write_record([LIMITS_HEADER]).map_err(io)?;
        if !self.limits.is_empty() {
            csv.write_record(self.limits.iter().map(|(device, _)| device.to_string()))
                .map_err(io)?;
            csv.write_record(self.limits.iter().map(|(_, limit)| limit.to_string()))
                .map_err(io)?;
        }

        csv.write_record([SEQUENCE_HEADER]).map_err(io)?;
        let header = std::iter::once(self.time_label.as_str()).chain(self.devices.iter().map(String::as_str));
        csv.write_record(header).map_err(io)?;

        for (event, at) in self.events.iter().zip(self.offsets_ms()) {
            let row: Vec<String> = match event {
                Event::SetStates { states, .. } => std::iter::once(at.to_string())
                    .chain(states.iter().map(|(_, open)| u8::from(*open).to_string()))
                    .collect(),
                Event::CheckPressure { device, min_psi, .. } => vec![
                    at.to_string(),
                    CHECK_MARKER.to_string(),
                    device.clone(),
                    min_psi.to_string(),
                ],
            };
            csv.write_record(&row).map_err(io)?;
        }
        csv.flush().map_err(|e| ScriptError::Read(e.to_string()))
    }

    pub fn to_csv_string(&self) -> Result<String, ScriptError> {
        let mut buffer = Vec::new();
        self.to_csv(&mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ScriptError::Read(e.to_string()))
    }
}

fn parse_event(
    line: u64,
    row: &StringRecord,
    devices: &[DeviceId],
    previous_ms: u64,
) -> Result<(u64, Event), ScriptError> {
    let is_check = row.get(1) == Some(CHECK_MARKER);
    let expected = if is_check { 4 } else { devices.len() + 1 };
    if row.len() != expected {
        return Err(ScriptError::MalformedRow {
            line,
            expected,
            found: row.len(),
        });
    }

    let raw_time = row.get(0).unwrap_or_default();
    let elapsed_ms = raw_time
        .parse::<u64>()
        .map_err(|_| ScriptError::InvalidTimestamp {
            line,
            value: raw_time.to_string(),
        })?;
    let delay_ms = elapsed_ms
        .checked_sub(previous_ms)
        .ok_or(ScriptError::NonMonotonicTime {
            line,
            elapsed_ms,
            previous_ms,
        })?;

    if is_check {
        let device = row.get(2).unwrap_or_default().to_string();
        let raw_psi = row.get(3).unwrap_or_default();
        let min_psi = raw_psi
            .parse::<f64>()
            .ok()
            .filter(|psi| psi.is_finite())
            .ok_or_else(|| ScriptError::InvalidPressure {
                line,
                value: raw_psi.to_string(),
            })?;
        log::debug!("{min_psi} psi lower bound for {device} at {elapsed_ms} ms");
        return Ok((
            elapsed_ms,
            Event::CheckPressure {
                delay_ms,
                device,
                min_psi,
            },
        ));
    }

    let states = devices
        .iter()
        .zip(row.iter().skip(1))
        .map(|(device, value)| match value {
            "0" => Ok((device.clone(), false)),
            "1" => Ok((device.clone(), true)),
            other => Err(ScriptError::InvalidState {
                line,
                device: device.clone(),
                value: other.to_string(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((elapsed_ms, Event::SetStates { delay_ms, states }))
}
