pub mod logger;
pub mod metrics;
pub mod modbus;

pub use logger::{
    FileSink, LogSink, LoggerConfig, LoggerError, LoggerStats, PersistenceError, TelemetryLogger,
};
pub use metrics::{init_metrics, serve_metrics, StatusBoard};
pub use modbus::{ModbusChannel, ModbusConfig, ModbusConnector, ModbusMap, ModbusPort};
