//! The device map: every sensor and valve on the stand, in log order.

use crate::port::DeviceLink;
use crate::record::LogRecord;
use crate::script::DeviceLimits;
use crate::sensor::{Calibration, Sensor, SensorKind};
use crate::valve::Valve;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RigError {
    #[error("duplicate device name {0}")]
    DuplicateName(String),

    #[error("device {0} has an unusable calibration (span must be finite and non-zero)")]
    BadCalibration(String),

    #[error("device name must not be empty")]
    EmptyName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub name: String,
    pub channel: String,
    #[serde(default)]
    pub negative_channel: Option<String>,
    pub calibration: Calibration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveSpec {
    pub name: String,
    pub output: String,
    #[serde(default)]
    pub normally_open: bool,
}

/// Serializable description of a rig, as found in the stand's JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigSpec {
    #[serde(default)]
    pub pressure: Vec<SensorSpec>,
    #[serde(default)]
    pub temperature: Vec<SensorSpec>,
    #[serde(default)]
    pub load: Vec<SensorSpec>,
    #[serde(default)]
    pub valves: Vec<ValveSpec>,
}

impl RigSpec {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rig {
    sensors: Vec<Sensor>,
    valves: Vec<Valve>,
}

impl Rig {
    /// Sensors are kept grouped pressure, temperature, load (stable within a
    /// group), which is also the column order of every log record.
    pub fn new(mut sensors: Vec<Sensor>, valves: Vec<Valve>) -> Result<Self, RigError> {
        let mut seen = HashSet::new();
        let names = sensors
            .iter()
            .map(Sensor::name)
            .chain(valves.iter().map(Valve::name));
        for name in names {
            if name.is_empty() {
                return Err(RigError::EmptyName);
            }
            if !seen.insert(name) {
                return Err(RigError::DuplicateName(name.to_string()));
            }
        }
        if let Some(bad) = sensors.iter().find(|s| !s.calibration().is_valid()) {
            return Err(RigError::BadCalibration(bad.name().to_string()));
        }
        sensors.sort_by_key(|s| kind_rank(s.kind()));
        Ok(Self { sensors, valves })
    }

    pub fn from_spec(spec: &RigSpec) -> Result<Self, RigError> {
        let groups = [
            (SensorKind::Pressure, &spec.pressure),
            (SensorKind::Temperature, &spec.temperature),
            (SensorKind::Load, &spec.load),
        ];
        let sensors = groups
            .into_iter()
            .flat_map(|(kind, specs)| {
                specs.iter().map(move |s| {
                    Sensor::new(
                        s.name.clone(),
                        kind,
                        s.channel.clone(),
                        s.negative_channel.clone(),
                        s.calibration,
                    )
                })
            })
            .collect();
        let valves = spec
            .valves
            .iter()
            .map(|v| Valve::new(v.name.clone(), v.output.clone(), v.normally_open))
            .collect();
        Self::new(sensors, valves)
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn valves(&self) -> &[Valve] {
        &self.valves
    }

    pub fn sensor(&self, name: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.name() == name)
    }

    pub fn sensor_mut(&mut self, name: &str) -> Option<&mut Sensor> {
        self.sensors.iter_mut().find(|s| s.name() == name)
    }

    pub fn valve(&self, name: &str) -> Option<&Valve> {
        self.valves.iter().find(|v| v.name() == name)
    }

    pub fn valve_mut(&mut self, name: &str) -> Option<&mut Valve> {
        self.valves.iter_mut().find(|v| v.name() == name)
    }

    /// Latest reading of a pressure sensor; `None` if no such pressure sensor.
    pub fn pressure(&self, name: &str) -> Option<f64> {
        self.sensor(name)
            .filter(|s| s.kind() == SensorKind::Pressure)
            .map(Sensor::value)
    }

    pub fn is_pressure_sensor(&self, name: &str) -> bool {
        self.pressure(name).is_some()
    }

    /// Read every sensor once. Failed channels read NaN; returns how many
    /// sensors failed.
    pub fn acquire(&mut self, link: &mut dyn DeviceLink) -> usize {
        let mut failures = 0;
        let connected = link.is_connected();
        for sensor in &mut self.sensors {
            if let Err(e) = sensor.update(link) {
                failures += 1;
                if connected {
                    log::debug!("{}: read failed: {}", sensor.name(), e);
                }
            }
        }
        failures
    }

    /// Adopt the hardware state of every valve output.
    pub fn sync_valves(&mut self, link: &mut dyn DeviceLink) {
        for valve in &mut self.valves {
            match valve.sync(link) {
                Ok(open) => log::info!(
                    "{} initial state: {}",
                    valve.name(),
                    if open { "OPEN" } else { "CLOSED" }
                ),
                Err(e) => log::warn!("{}: could not read initial state: {}", valve.name(), e),
            }
        }
    }

    /// Replace every pressure redline with the ones in `limits`. Limits on
    /// unknown devices or non-pressure sensors are logged and skipped.
    pub fn apply_limits(&mut self, limits: &DeviceLimits) {
        self.clear_redlines();
        for (device, redline) in limits.iter() {
            match self.sensor_mut(device) {
                Some(sensor) if sensor.kind() == SensorKind::Pressure => {
                    sensor.set_redline(Some(redline));
                    log::info!("Redline of {redline} added for {device}");
                }
                Some(_) => log::warn!("Redline for non-pressure sensor {device} skipped"),
                None => log::warn!("Redline for unknown device {device} skipped"),
            }
        }
    }

    pub fn clear_redlines(&mut self) {
        for sensor in &mut self.sensors {
            sensor.set_redline(None);
        }
    }

    /// Pressure sensors currently above their redline, as
    /// `(name, redline, value)`.
    pub fn redline_breaches(&self) -> Vec<(&str, f64, f64)> {
        self.sensors
            .iter()
            .filter(|s| s.kind() == SensorKind::Pressure && s.over_redline())
            .filter_map(|s| s.redline().map(|limit| (s.name(), limit, s.value())))
            .collect()
    }

    pub fn open_valves(&self) -> Vec<&str> {
        self.valves
            .iter()
            .filter(|v| v.is_open())
            .map(Valve::name)
            .collect()
    }

    pub fn log_header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(1 + self.sensors.len() + self.valves.len());
        header.push("Timestamp".to_string());
        header.extend(
            self.sensors
                .iter()
                .map(|s| format!("{} {}", s.name(), s.kind().column_label())),
        );
        header.extend(self.valves.iter().map(|v| format!("{} State", v.name())));
        header
    }

    pub fn record(&self, timestamp: NaiveDateTime) -> LogRecord {
        let readings = |kind: SensorKind| -> Vec<f64> {
            self.sensors
                .iter()
                .filter(|s| s.kind() == kind)
                .map(Sensor::value)
                .collect()
        };
        LogRecord {
            timestamp,
            pressures: readings(SensorKind::Pressure),
            temperatures: readings(SensorKind::Temperature),
            loads: readings(SensorKind::Load),
            valve_states: self.valves.iter().map(Valve::is_open).collect(),
        }
    }
}

fn kind_rank(kind: SensorKind) -> u8 {
    match kind {
        SensorKind::Pressure => 0,
        SensorKind::Temperature => 1,
        SensorKind::Load => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "pressure": [
            {"name": "PT-OX-01", "channel": "AIN0", "negative_channel": "AIN1",
             "calibration": {"offset": 0.5, "span": 4.0, "max_unit": 1000.0}}
        ],
        "temperature": [
            {"name": "TC-01", "channel": "AIN4",
             "calibration": {"span": 0.05, "max_unit": 1250.0, "linear_offset": 2.0}}
        ],
        "load": [
            {"name": "LC-01", "channel": "AIN2", "negative_channel": "AIN3",
             "calibration": {"scalar": 1.02, "span": 0.02, "max_unit": 500.0}}
        ],
        "valves": [
            {"name": "SV-OX-01", "output": "FIO0"},
            {"name": "SV-N2-01", "output": "FIO1", "normally_open": true}
        ]
    }"#;

    fn rig() -> Rig {
        Rig::from_spec(&RigSpec::from_json(SPEC).unwrap()).unwrap()
    }

    #[test]
    fn header_follows_kind_order() {
        assert_eq!(
            rig().log_header(),
            vec![
                "Timestamp",
                "PT-OX-01 Pressure",
                "TC-01 Temperature",
                "LC-01 Load",
                "SV-OX-01 State",
                "SV-N2-01 State"
            ]
        );
    }

    #[test]
    fn new_groups_sensors_by_kind() {
        let cal = Calibration {
            scalar: 1.0,
            offset: 0.0,
            span: 1.0,
            max_unit: 1.0,
            linear_offset: 0.0,
        };
        let rig = Rig::new(
            vec![
                Sensor::new("LC", SensorKind::Load, "AIN2", None, cal),
                Sensor::new("PT", SensorKind::Pressure, "AIN0", None, cal),
            ],
            vec![],
        )
        .unwrap();
        assert_eq!(rig.sensors()[0].name(), "PT");
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut spec = RigSpec::from_json(SPEC).unwrap();
        spec.valves.push(ValveSpec {
            name: "PT-OX-01".to_string(),
            output: "FIO2".to_string(),
            normally_open: false,
        });
        assert_eq!(
            Rig::from_spec(&spec).unwrap_err(),
            RigError::DuplicateName("PT-OX-01".to_string())
        );
    }

    #[test]
    fn rejects_zero_span() {
        let mut spec = RigSpec::from_json(SPEC).unwrap();
        spec.pressure[0].calibration.span = 0.0;
        assert!(matches!(
            Rig::from_spec(&spec),
            Err(RigError::BadCalibration(_))
        ));
    }

    #[test]
    fn record_matches_model_state() {
        let mut rig = rig();
        rig.sensor_mut("PT-OX-01").unwrap().record(250.0);
        rig.sensor_mut("LC-01").unwrap().record(12.5);
        let stamp = chrono::NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let record = rig.record(stamp);
        assert_eq!(record.pressures, vec![250.0]);
        assert!(record.temperatures[0].is_nan());
        assert_eq!(record.loads, vec![12.5]);
        assert_eq!(record.valve_states, vec![false, true]);
        assert_eq!(record.width(), rig.log_header().len());
    }

    #[test]
    fn pressure_lookup_ignores_other_kinds() {
        let rig = rig();
        assert!(rig.is_pressure_sensor("PT-OX-01"));
        assert!(!rig.is_pressure_sensor("TC-01"));
        assert!(!rig.is_pressure_sensor("SV-OX-01"));
    }

    #[test]
    fn limits_replace_earlier_redlines() {
        let mut rig = rig();
        let mut first = DeviceLimits::default();
        first.insert("PT-OX-01", 500.0);
        rig.apply_limits(&first);
        assert_eq!(rig.sensor("PT-OX-01").unwrap().redline(), Some(500.0));

        let mut second = DeviceLimits::default();
        second.insert("PT-OX-01", -1.0);
        rig.apply_limits(&second);
        assert_eq!(rig.sensor("PT-OX-01").unwrap().redline(), None);

        rig.sensor_mut("PT-OX-01").unwrap().record(600.0);
        assert!(rig.redline_breaches().is_empty());
    }

    #[test]
    fn limits_only_attach_to_pressure_sensors() {
        let mut rig = rig();
        let mut limits = DeviceLimits::default();
        limits.insert("TC-01", 100.0);
        limits.insert("LC-01", 10.0);
        rig.apply_limits(&limits);
        assert_eq!(rig.sensor("TC-01").unwrap().redline(), None);
        assert_eq!(rig.sensor("LC-01").unwrap().redline(), None);

        // A redline set directly on a load cell is never reported.
        let load = rig.sensor_mut("LC-01").unwrap();
        load.set_redline(Some(10.0));
        load.record(12.5);
        assert!(rig.redline_breaches().is_empty());
    }
}
