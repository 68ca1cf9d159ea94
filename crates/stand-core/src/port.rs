use thiserror::Error;

/// Failure talking to the DAQ device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device unreachable")]
    Unreachable,

    #[error("device did not answer within {0} ms")]
    Timeout(u64),

    #[error("unknown channel {0}")]
    UnknownChannel(String),

    #[error("transport I/O failure: {0}")]
    Io(String),
}

/// Named-channel access to a connected instrument.
///
/// Every call may fail with a [`TransportError`]; callers treat each call as
/// bounded in latency (the transport enforces its own timeouts).
pub trait DevicePort: Send {
    fn read(&mut self, channel: &str) -> Result<f64, TransportError>;
    fn write(&mut self, channel: &str, value: f64) -> Result<(), TransportError>;
    fn read_identity(&mut self) -> Result<u64, TransportError>;
    fn close(&mut self) {}
}

/// Opens fresh device handles for the connection supervisor.
pub trait Connector: Send {
    fn open(&mut self) -> Result<Box<dyn DevicePort>, TransportError>;
}

/// Access to the device link handed to the models and the sequencer.
///
/// Only the connection supervisor holds a device handle; everything else
/// borrows it through this trait for the duration of one call.
pub trait DeviceLink {
    fn is_connected(&self) -> bool;
    fn port(&mut self) -> Option<&mut (dyn DevicePort + 'static)>;
}
