//! Modbus TCP device port.
//!
//! The Modbus client is async, the Device Port is not. Each opened port owns
//! a worker thread running its own tokio runtime; calls are forwarded to it
//! and every reply is awaited for at most the configured timeout.

use serde::{Deserialize, Serialize};
use stand_core::{Connector, DevicePort, TransportError};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

fn unit_scale() -> f64 {
    1.0
}

/// Where a named channel lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModbusChannel {
    /// Analog input: input register times `scale`.
    Input {
        register: u16,
        #[serde(default = "unit_scale")]
        scale: f64,
    },
    /// Digital output: holding register, 0 or 1.
    Holding { register: u16 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModbusMap {
    #[serde(default)]
    pub channels: HashMap<String, ModbusChannel>,
    /// First of two holding registers carrying the device serial (high word first).
    #[serde(default)]
    pub identity_register: u16,
}

impl ModbusMap {
    pub fn resolve(&self, channel: &str) -> Result<ModbusChannel, TransportError> {
        self.channels
            .get(channel)
            .copied()
            .ok_or_else(|| TransportError::UnknownChannel(channel.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct ModbusConfig {
    pub addr: SocketAddr,
    pub map: ModbusMap,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Op {
    ReadInput { register: u16 },
    ReadHolding { register: u16, count: u16 },
    WriteHolding { register: u16, value: u16 },
}

struct Request {
    op: Op,
    reply: std_mpsc::SyncSender<Result<Vec<u16>, TransportError>>,
}

pub struct ModbusConnector {
    config: ModbusConfig,
    map: Arc<ModbusMap>,
}

impl ModbusConnector {
    pub fn new(config: ModbusConfig) -> Self {
        let map = Arc::new(config.map.clone());
        Self { config, map }
    }
}

impl Connector for ModbusConnector {
    fn open(&mut self) -> Result<Box<dyn DevicePort>, TransportError> {
        let port = ModbusPort::connect(self.config.addr, self.map.clone(), self.config.timeout)?;
        Ok(Box::new(port))
    }
}

pub struct ModbusPort {
    requests: Option<mpsc::UnboundedSender<Request>>,
    map: Arc<ModbusMap>,
    timeout: Duration,
    addr: SocketAddr,
}

impl ModbusPort {
    pub fn connect(
        addr: SocketAddr,
        map: Arc<ModbusMap>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        thread::Builder::new()
            .name(format!("modbus-{addr}"))
            .spawn(move || worker(addr, timeout, rx, ready_tx))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        match ready_rx.recv_timeout(timeout + Duration::from_millis(100)) {
            Ok(Ok(())) => {
                info!("Connected to Modbus TCP at {}", addr);
                Ok(Self {
                    requests: Some(tx),
                    map,
                    timeout,
                    addr,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(duration_ms(timeout))),
        }
    }

    fn call(&self, op: Op) -> Result<Vec<u16>, TransportError> {
        let requests = self.requests.as_ref().ok_or(TransportError::Unreachable)?;
        let (reply, response) = std_mpsc::sync_channel(1);
        requests
            .send(Request { op, reply })
            .map_err(|_| TransportError::Unreachable)?;
        response
            .recv_timeout(self.timeout + Duration::from_millis(50))
            .map_err(|_| TransportError::Timeout(duration_ms(self.timeout)))?
    }
}

impl DevicePort for ModbusPort {
    fn read(&mut self, channel: &str) -> Result<f64, TransportError> {
        let op = match self.map.resolve(channel)? {
            ModbusChannel::Input { register, .. } => Op::ReadInput { register },
            ModbusChannel::Holding { register } => Op::ReadHolding { register, count: 1 },
        };
        let words = self.call(op)?;
        let raw = words.first().copied().ok_or_else(|| short_reply(channel))?;
        Ok(match self.map.resolve(channel)? {
            ModbusChannel::Input { scale, .. } => f64::from(raw) * scale,
            ModbusChannel::Holding { .. } => f64::from(raw),
        })
    }

    fn write(&mut self, channel: &str, value: f64) -> Result<(), TransportError> {
        let ModbusChannel::Holding { register } = self.map.resolve(channel)? else {
            return Err(TransportError::UnknownChannel(format!("{channel} is not an output")));
        };
        let value = u16::from(value >= 0.5);
        self.call(Op::WriteHolding { register, value }).map(|_| ())
    }

    fn read_identity(&mut self) -> Result<u64, TransportError> {
        let words = self.call(Op::ReadHolding {
            register: self.map.identity_register,
            count: 2,
        })?;
        match words.as_slice() {
            [high, low, ..] => Ok((u64::from(*high) << 16) | u64::from(*low)),
            _ => Err(short_reply("identity")),
        }
    }

    fn close(&mut self) {
        if self.requests.take().is_some() {
            debug!("Closing Modbus link to {}", self.addr);
        }
    }
}

impl Drop for ModbusPort {
    fn drop(&mut self) {
        self.close();
    }
}

fn short_reply(what: &str) -> TransportError {
    TransportError::Io(format!("short Modbus reply for {what}"))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn transport_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => TransportError::Unreachable,
        _ => TransportError::Io(e.to_string()),
    }
}

fn worker(
    addr: SocketAddr,
    timeout: Duration,
    mut requests: mpsc::UnboundedReceiver<Request>,
    ready: std_mpsc::SyncSender<Result<(), TransportError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(TransportError::Io(e.to_string())));
            return;
        }
    };

    runtime.block_on(async move {
        let mut ctx = match tokio::time::timeout(timeout, tcp::connect(addr)).await {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => {
                warn!("Failed to connect to Modbus TCP at {}: {}", addr, e);
                let _ = ready.send(Err(transport_error(e)));
                return;
            }
            Err(_) => {
                let _ = ready.send(Err(TransportError::Timeout(duration_ms(timeout))));
                return;
            }
        };
        if ready.send(Ok(())).is_err() {
            return;
        }

        while let Some(request) = requests.recv().await {
            let call = async {
                match request.op {
                    Op::ReadInput { register } => ctx.read_input_registers(register, 1).await,
                    Op::ReadHolding { register, count } => {
                        ctx.read_holding_registers(register, count).await
                    }
                    Op::WriteHolding { register, value } => ctx
                        .write_single_register(register, value)
                        .await
                        .map(|()| Vec::new()),
                }
            };
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(words)) => Ok(words),
                Ok(Err(e)) => {
                    warn!("Modbus request {:?} failed: {}", request.op, e);
                    Err(transport_error(e))
                }
                Err(_) => Err(TransportError::Timeout(duration_ms(timeout))),
            };
            let _ = request.reply.send(result);
        }
        debug!("Modbus worker for {} exiting", addr);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    const MAP: &str = r#"{
        "identity_register": 100,
        "channels": {
            "AIN0": {"kind": "input", "register": 0, "scale": 0.001},
            "AIN1": {"kind": "input", "register": 1},
            "FIO0": {"kind": "holding", "register": 10}
        }
    }"#;

    #[test]
    fn map_resolves_channels() {
        let map: ModbusMap = serde_json::from_str(MAP).unwrap();
        assert_eq!(map.identity_register, 100);
        assert_eq!(
            map.resolve("AIN0").unwrap(),
            ModbusChannel::Input {
                register: 0,
                scale: 0.001
            }
        );
        assert_eq!(
            map.resolve("AIN1").unwrap(),
            ModbusChannel::Input {
                register: 1,
                scale: 1.0
            }
        );
        assert_eq!(
            map.resolve("FIO9"),
            Err(TransportError::UnknownChannel("FIO9".to_string()))
        );
    }

    #[test]
    fn refused_connection_is_reported() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let map = Arc::new(serde_json::from_str::<ModbusMap>(MAP).unwrap());
        let result = ModbusPort::connect(addr, map, Duration::from_millis(200));
        assert!(result.is_err());
    }
}
