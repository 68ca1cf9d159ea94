use crate::port::{DeviceLink, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of recent readings kept per sensor.
pub const RECENT_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Pressure,
    Temperature,
    Load,
}

impl SensorKind {
    /// Suffix used for this kind's column in the log header.
    pub fn column_label(&self) -> &'static str {
        match self {
            SensorKind::Pressure => "Pressure",
            SensorKind::Temperature => "Temperature",
            SensorKind::Load => "Load",
        }
    }
}

/// Linear voltage-to-unit calibration.
///
/// `value = scalar * (raw - offset) / span * max_unit - linear_offset`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default = "unit_scalar")]
    pub scalar: f64,
    #[serde(default)]
    pub offset: f64,
    pub span: f64,
    pub max_unit: f64,
    #[serde(default)]
    pub linear_offset: f64,
}

fn unit_scalar() -> f64 {
    1.0
}

impl Calibration {
    pub fn apply(&self, raw: f64) -> f64 {
        self.scalar * (raw - self.offset) / self.span * self.max_unit - self.linear_offset
    }

    pub fn is_valid(&self) -> bool {
        self.span.is_finite()
            && self.span != 0.0
            && self.scalar.is_finite()
            && self.offset.is_finite()
            && self.max_unit.is_finite()
            && self.linear_offset.is_finite()
    }
}

/// An analog sensor read as a (possibly differential) channel pair.
#[derive(Debug, Clone)]
pub struct Sensor {
    name: String,
    kind: SensorKind,
    positive: String,
    negative: Option<String>,
    calibration: Calibration,
    value: f64,
    recent: VecDeque<f64>,
    redline: Option<f64>,
}

impl Sensor {
    pub fn new(
        name: impl Into<String>,
        kind: SensorKind,
        positive: impl Into<String>,
        negative: Option<String>,
        calibration: Calibration,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            positive: positive.into(),
            negative: negative.filter(|channel| !channel.is_empty()),
            calibration,
            value: f64::NAN,
            recent: VecDeque::with_capacity(RECENT_WINDOW),
            redline: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Last converted reading; NaN until the first successful read and after
    /// any failed one.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn recent(&self) -> impl Iterator<Item = f64> + '_ {
        self.recent.iter().copied()
    }

    pub fn redline(&self) -> Option<f64> {
        self.redline
    }

    pub fn set_redline(&mut self, redline: Option<f64>) {
        self.redline = redline;
    }

    /// True when the current reading is above the configured redline.
    pub fn over_redline(&self) -> bool {
        matches!(self.redline, Some(limit) if self.value > limit)
    }

    /// Read the channel(s) and convert. On failure the reading becomes NaN
    /// and the error is handed back for the caller to log.
    pub fn update(&mut self, link: &mut dyn DeviceLink) -> Result<f64, TransportError> {
        match self.read_raw(link) {
            Ok(raw) => {
                let value = self.calibration.apply(raw);
                self.record(value);
                Ok(value)
            }
            Err(e) => {
                self.record(f64::NAN);
                Err(e)
            }
        }
    }

    /// Store a converted reading as if it had just been sampled.
    pub fn record(&mut self, value: f64) {
        self.value = value;
        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
    }

    fn read_raw(&self, link: &mut dyn DeviceLink) -> Result<f64, TransportError> {
        let port = link.port().ok_or(TransportError::Unreachable)?;
        let positive = port.read(&self.positive)?;
        let negative = match &self.negative {
            Some(channel) => port.read(channel)?,
            None => 0.0,
        };
        Ok(positive - negative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDaq;

    fn pressure_cal() -> Calibration {
        Calibration {
            scalar: 1.0,
            offset: 0.5,
            span: 4.0,
            max_unit: 1000.0,
            linear_offset: 0.0,
        }
    }

    #[test]
    fn converts_differential_pair() {
        let daq = SimulatedDaq::new(7);
        daq.set_channel("AIN0", 2.75);
        daq.set_channel("AIN1", 0.25);
        let mut link = daq.link();

        let mut sensor = Sensor::new(
            "PT-OX-01",
            SensorKind::Pressure,
            "AIN0",
            Some("AIN1".to_string()),
            pressure_cal(),
        );
        let value = sensor.update(&mut link).unwrap();
        assert!((value - 500.0).abs() < 1e-9);
        assert_eq!(sensor.value(), value);
    }

    #[test]
    fn read_failure_degrades_to_nan() {
        let daq = SimulatedDaq::new(7);
        daq.set_channel("AIN0", 2.5);
        daq.fail_channel("AIN0");
        let mut link = daq.link();

        let mut sensor = Sensor::new("PT", SensorKind::Pressure, "AIN0", None, pressure_cal());
        assert!(sensor.update(&mut link).is_err());
        assert!(sensor.value().is_nan());
    }

    #[test]
    fn disconnected_link_reads_nan() {
        let daq = SimulatedDaq::new(7);
        let mut link = daq.link();
        link.disconnect();

        let mut sensor = Sensor::new("TC", SensorKind::Temperature, "AIN4", None, pressure_cal());
        assert_eq!(sensor.update(&mut link), Err(TransportError::Unreachable));
        assert!(sensor.value().is_nan());
    }

    #[test]
    fn recent_window_is_bounded() {
        let mut sensor = Sensor::new("LC", SensorKind::Load, "AIN2", None, pressure_cal());
        for i in 0..8 {
            sensor.record(i as f64);
        }
        let recent: Vec<f64> = sensor.recent().collect();
        assert_eq!(recent, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn redline_compares_current_value() {
        let mut sensor = Sensor::new("PT", SensorKind::Pressure, "AIN0", None, pressure_cal());
        sensor.set_redline(Some(600.0));
        sensor.record(599.0);
        assert!(!sensor.over_redline());
        sensor.record(601.0);
        assert!(sensor.over_redline());
        sensor.record(f64::NAN);
        assert!(!sensor.over_redline());
    }
}
