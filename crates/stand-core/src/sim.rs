use crate::port::{Connector, DeviceLink, DevicePort, TransportError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct DaqState {
    serial: u64,
    online: bool,
    channels: HashMap<String, f64>,
    failing: HashSet<String>,
    writes: Vec<(String, f64)>,
    identity_failures: u32,
    opens: u32,
}

/// In-memory DAQ used by tests and the `--simulate` runner.
///
/// Clones share the same device, so a test can keep one handle to script
/// faults while the supervisor owns the ports it opened.
#[derive(Debug, Clone)]
pub struct SimulatedDaq {
    state: Arc<Mutex<DaqState>>,
}

impl SimulatedDaq {
    pub fn new(serial: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(DaqState {
                serial,
                online: true,
                ..DaqState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, DaqState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug or unplug the device. Every call on an unplugged device fails.
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    pub fn set_channel(&self, channel: &str, value: f64) {
        self.state().channels.insert(channel.to_string(), value);
    }

    pub fn channel(&self, channel: &str) -> Option<f64> {
        self.state().channels.get(channel).copied()
    }

    /// Make reads and writes on `channel` fail until [`heal_channel`](Self::heal_channel).
    pub fn fail_channel(&self, channel: &str) {
        self.state().failing.insert(channel.to_string());
    }

    pub fn heal_channel(&self, channel: &str) {
        self.state().failing.remove(channel);
    }

    /// Fail the next `count` identity reads while staying online.
    pub fn fail_identity(&self, count: u32) {
        self.state().identity_failures = count;
    }

    pub fn writes(&self) -> Vec<(String, f64)> {
        self.state().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes.len()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Number of handles opened through [`SimConnector`].
    pub fn opens(&self) -> u32 {
        self.state().opens
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector { daq: self.clone() }
    }

    /// A permanently attached link, for exercising the models directly.
    pub fn link(&self) -> SimLink {
        SimLink {
            port: SimPort { daq: self.clone() },
            connected: true,
        }
    }
}

pub struct SimConnector {
    daq: SimulatedDaq,
}

impl Connector for SimConnector {
    fn open(&mut self) -> Result<Box<dyn DevicePort>, TransportError> {
        let mut state = self.daq.state();
        if !state.online {
            return Err(TransportError::Unreachable);
        }
        state.opens += 1;
        Ok(Box::new(SimPort {
            daq: self.daq.clone(),
        }))
    }
}

pub struct SimPort {
    daq: SimulatedDaq,
}

impl SimPort {
    fn check(state: &DaqState, channel: &str) -> Result<(), TransportError> {
        if !state.online {
            return Err(TransportError::Unreachable);
        }
        if state.failing.contains(channel) {
            return Err(TransportError::Io(format!("{channel} not responding")));
        }
        Ok(())
    }
}

impl DevicePort for SimPort {
    fn read(&mut self, channel: &str) -> Result<f64, TransportError> {
        let state = self.daq.state();
        Self::check(&state, channel)?;
        Ok(state.channels.get(channel).copied().unwrap_or(0.0))
    }

    fn write(&mut self, channel: &str, value: f64) -> Result<(), TransportError> {
        let mut state = self.daq.state();
        Self::check(&state, channel)?;
        state.channels.insert(channel.to_string(), value);
        state.writes.push((channel.to_string(), value));
        Ok(())
    }

    fn read_identity(&mut self) -> Result<u64, TransportError> {
        let mut state = self.daq.state();
        if !state.online {
            return Err(TransportError::Unreachable);
        }
        if state.identity_failures > 0 {
            state.identity_failures -= 1;
            return Err(TransportError::Timeout(100));
        }
        Ok(state.serial)
    }
}

/// Device link with no supervisor behind it.
pub struct SimLink {
    port: SimPort,
    connected: bool,
}

impl SimLink {
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    pub fn reconnect(&mut self) {
        self.connected = true;
    }
}

impl DeviceLink for SimLink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn port(&mut self) -> Option<&mut (dyn DevicePort + 'static)> {
        if self.connected {
            let port: &mut (dyn DevicePort + 'static) = &mut self.port;
            Some(port)
        } else {
            None
        }
    }
}
