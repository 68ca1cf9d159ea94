use crate::port::{DeviceLink, TransportError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuationError {
    #[error("device link is down")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Binary solenoid valve driven by one digital output.
#[derive(Debug, Clone)]
pub struct Valve {
    name: String,
    output: String,
    normally_open: bool,
    open: bool,
}

impl Valve {
    /// A new valve starts in its de-energized position.
    pub fn new(name: impl Into<String>, output: impl Into<String>, normally_open: bool) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            normally_open,
            open: normally_open,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn normally_open(&self) -> bool {
        self.normally_open
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open(&mut self, link: &mut dyn DeviceLink) -> Result<(), ActuationError> {
        self.set(link, true)
    }

    pub fn close(&mut self, link: &mut dyn DeviceLink) -> Result<(), ActuationError> {
        self.set(link, false)
    }

    /// Write the output for `open`. The model only changes state once the
    /// write has been accepted by the device.
    pub fn set(&mut self, link: &mut dyn DeviceLink, open: bool) -> Result<(), ActuationError> {
        let port = link.port().ok_or(ActuationError::NotConnected)?;
        port.write(&self.output, self.output_level(open))?;
        self.open = open;
        log::debug!(
            "{} -> {} ({}={})",
            self.name,
            if open { "open" } else { "closed" },
            self.output,
            self.output_level(open)
        );
        Ok(())
    }

    /// Adopt whatever state the output currently holds on the device.
    pub fn sync(&mut self, link: &mut dyn DeviceLink) -> Result<bool, ActuationError> {
        let port = link.port().ok_or(ActuationError::NotConnected)?;
        let level = port.read(&self.output)?;
        let high = level >= 0.5;
        self.open = if self.normally_open { high } else { !high };
        Ok(self.open)
    }

    /// Normally-open valves drive 1 when open; normally-closed valves drive 0.
    fn output_level(&self, open: bool) -> f64 {
        match (self.normally_open, open) {
            (true, true) | (false, false) => 1.0,
            (true, false) | (false, true) => 0.0,
        }
    }
}
