use crate::port::{Connector, DeviceLink, DevicePort, TransportError};
use serde::Serialize;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

pub type StatusCallback = Box<dyn FnMut(&ConnectionStatus) + Send>;

/// Owns the one device handle and keeps it alive with a heartbeat.
pub struct ConnectionSupervisor<C: Connector> {
    connector: C,
    port: Option<Box<dyn DevicePort>>,
    status: ConnectionStatus,
    failure_threshold: u32,
    heartbeat_active: bool,
    serial: Option<u64>,
    on_status: Option<StatusCallback>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            port: None,
            status: ConnectionStatus::default(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            heartbeat_active: false,
            serial: None,
            on_status: None,
        }
    }

    /// Consecutive failed heartbeats before the link is declared lost. Zero
    /// is treated as one.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn on_status(&mut self, callback: impl FnMut(&ConnectionStatus) + Send + 'static) {
        self.on_status = Some(Box::new(callback));
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn heartbeat_active(&self) -> bool {
        self.heartbeat_active
    }

    /// Identity reported by the device on the last successful verify.
    pub fn serial(&self) -> Option<u64> {
        self.serial
    }

    /// Drop any stale handle and open a verified fresh one.
    pub fn connect(&mut self) -> Result<u64, TransportError> {
        self.release();
        self.heartbeat_active = true;
        match self.open_verified() {
            Ok(serial) => {
                log::info!("Connected to DAQ serial {serial}");
                self.set_connected(true, None);
                self.notify();
                Ok(serial)
            }
            Err(e) => {
                log::warn!("Failed to connect to DAQ: {e}");
                self.set_connected(false, Some(&e));
                self.notify();
                Err(e)
            }
        }
    }

    /// One heartbeat. Returns the new link state when it changed.
    pub fn heartbeat_tick(&mut self) -> Option<bool> {
        if !self.heartbeat_active {
            return None;
        }
        let was_connected = self.status.connected;

        let checked = match self.port.as_mut() {
            Some(port) => port.read_identity(),
            None => self.open_verified(),
        };

        match checked {
            Ok(serial) => {
                self.serial = Some(serial);
                self.status.consecutive_failures = 0;
                if !was_connected {
                    log::info!("DAQ link restored (serial {serial})");
                    self.set_connected(true, None);
                }
            }
            Err(e) => {
                self.status.consecutive_failures = self.status.consecutive_failures.saturating_add(1);
                self.status.last_error = Some(e.to_string());
                if self.port.is_some() {
                    log::debug!(
                        "Heartbeat failed ({}/{}): {e}",
                        self.status.consecutive_failures,
                        self.failure_threshold
                    );
                    if self.status.consecutive_failures >= self.failure_threshold {
                        log::warn!("DAQ link lost: {e}");
                        self.release();
                        self.status.connected = false;
                    }
                }
            }
        }

        let changed = self.status.connected != was_connected;
        if changed {
            self.notify();
            Some(self.status.connected)
        } else {
            None
        }
    }

    pub fn close(&mut self) {
        self.heartbeat_active = false;
        self.release();
        let was_connected = self.status.connected;
        self.status.connected = false;
        self.status.consecutive_failures = 0;
        if was_connected {
            log::info!("DAQ connection closed");
            self.notify();
        }
    }

    fn open_verified(&mut self) -> Result<u64, TransportError> {
        let mut port = self.connector.open()?;
        match port.read_identity() {
            Ok(serial) => {
                self.port = Some(port);
                self.serial = Some(serial);
                Ok(serial)
            }
            Err(e) => {
                port.close();
                Err(e)
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut port) = self.port.take() {
            port.close();
        }
    }

    fn set_connected(&mut self, connected: bool, error: Option<&TransportError>) {
        self.status.connected = connected;
        if connected {
            self.status.consecutive_failures = 0;
        } else {
            self.status.consecutive_failures = self.status.consecutive_failures.saturating_add(1);
        }
        if let Some(e) = error {
            self.status.last_error = Some(e.to_string());
        }
    }

    fn notify(&mut self) {
        if let Some(callback) = self.on_status.as_mut() {
            callback(&self.status);
        }
    }
}

impl<C: Connector> DeviceLink for ConnectionSupervisor<C> {
    fn is_connected(&self) -> bool {
        self.status.connected && self.port.is_some()
    }

    fn port(&mut self) -> Option<&mut (dyn DevicePort + 'static)> {
        if !self.status.connected {
            return None;
        }
        self.port.as_deref_mut()
    }
}
