use serde::Deserialize;
use stand_core::{Rig, RigError, RigSpec};
use stand_io::ModbusMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} needs a value")]
    MissingValue(String),

    #[error("invalid value `{value}` for {flag}")]
    InvalidValue { flag: String, value: String },

    #[error("unknown option {0} (see --help)")]
    UnknownFlag(String),

    #[error("--rig is required unless --simulate is given")]
    MissingRig,

    #[error("no device: pass --modbus <ADDR> or --simulate")]
    NoDevice,

    #[error("rig description has no modbus channel map")]
    MissingModbusMap,

    #[error("failed to read {}: {source}", path.display())]
    ReadRig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    ParseRig {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Rig(#[from] RigError),
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub rig_path: Option<PathBuf>,
    pub script_path: Option<PathBuf>,
    pub auto_start: bool,
    pub log_dir: PathBuf,
    pub log_name: String,
    pub simulate: bool,
    pub modbus_addr: Option<SocketAddr>,
    pub modbus_timeout: Duration,
    pub heartbeat: Duration,
    pub failure_threshold: u32,
    pub high_rate: Duration,
    pub low_rate: Duration,
    pub queue_capacity: usize,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub diagnostics_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            rig_path: None,
            script_path: None,
            auto_start: false,
            log_dir: PathBuf::from("logs"),
            log_name: "log".to_string(),
            simulate: false,
            modbus_addr: None,
            modbus_timeout: stand_io::modbus::DEFAULT_TIMEOUT,
            heartbeat: Duration::from_millis(200),
            failure_threshold: 1,
            high_rate: Duration::from_millis(10),
            low_rate: Duration::from_millis(500),
            queue_capacity: 1_000_000,
            run_seconds: None,
            json_logs: false,
            diagnostics_dir: None,
            metrics_addr: None,
            audit_path: None,
        }
    }
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, ConfigError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parsed<T: std::str::FromStr>(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, ConfigError> {
    let raw = value(args, i, flag)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw.to_string(),
    })
}

fn millis(args: &[String], i: &mut usize, flag: &str) -> Result<Duration, ConfigError> {
    let ms: u64 = parsed(args, i, flag)?;
    if ms == 0 {
        return Err(ConfigError::InvalidValue {
            flag: flag.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--rig" => cfg.rig_path = Some(PathBuf::from(value(args, &mut i, flag)?)),
                "--script" => cfg.script_path = Some(PathBuf::from(value(args, &mut i, flag)?)),
                "--start" => cfg.auto_start = true,
                "--log-dir" => cfg.log_dir = PathBuf::from(value(args, &mut i, flag)?),
                "--log-name" => cfg.log_name = value(args, &mut i, flag)?.to_string(),
                "--simulate" => cfg.simulate = true,
                "--modbus" => cfg.modbus_addr = Some(parsed(args, &mut i, flag)?),
                "--modbus-timeout-ms" => cfg.modbus_timeout = millis(args, &mut i, flag)?,
                "--heartbeat-ms" => cfg.heartbeat = millis(args, &mut i, flag)?,
                "--failure-threshold" => cfg.failure_threshold = parsed(args, &mut i, flag)?,
                "--high-rate-ms" => cfg.high_rate = millis(args, &mut i, flag)?,
                "--low-rate-ms" => cfg.low_rate = millis(args, &mut i, flag)?,
                "--queue-capacity" => cfg.queue_capacity = parsed(args, &mut i, flag)?,
                "--run-seconds" => cfg.run_seconds = Some(parsed(args, &mut i, flag)?),
                "--json-logs" => cfg.json_logs = true,
                "--diagnostics-dir" => {
                    cfg.diagnostics_dir = Some(PathBuf::from(value(args, &mut i, flag)?))
                }
                "--metrics-addr" => cfg.metrics_addr = Some(value(args, &mut i, flag)?.to_string()),
                "--audit-log" => cfg.audit_path = Some(PathBuf::from(value(args, &mut i, flag)?)),
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                other => return Err(ConfigError::UnknownFlag(other.to_string())),
            }
            i += 1;
        }

        if !cfg.show_help {
            if cfg.rig_path.is_none() && !cfg.simulate {
                return Err(ConfigError::MissingRig);
            }
            if cfg.modbus_addr.is_none() && !cfg.simulate {
                return Err(ConfigError::NoDevice);
            }
        }
        Ok(cfg)
    }

    pub fn print_help() {
        println!(
            r#"stand-ctl - Test stand sequencer and telemetry logger

USAGE:
    stand-ctl [OPTIONS]

OPTIONS:
    --rig <PATH>              JSON rig description (sensors, valves, modbus map)
    --script <PATH>           Sequence script to load at startup
    --start                   Start the loaded script once the stand is up
    --log-dir <DIR>           Directory for telemetry CSV files [default: logs]
    --log-name <NAME>         Base name of telemetry files [default: log]
    --simulate                Use the in-memory DAQ (and a demo rig if --rig is absent)
    --modbus <ADDR>           Connect to the DAQ via Modbus TCP (e.g. 192.168.1.10:502)
    --modbus-timeout-ms <MS>  Per-request Modbus timeout [default: 500]
    --heartbeat-ms <MS>       Heartbeat period [default: 200]
    --failure-threshold <N>   Failed heartbeats before the link is declared lost [default: 1]
    --high-rate-ms <MS>       Sample period at high cadence [default: 10]
    --low-rate-ms <MS>        Sample period at low cadence [default: 500]
    --queue-capacity <N>      Telemetry queue bound [default: 1000000]
    --run-seconds <SECS>      Run for a fixed duration then exit
    --json-logs               Output logs in JSON format (for log aggregation)
    --diagnostics-dir <DIR>   Also write JSON diagnostics to a daily rolling file
    --metrics-addr <ADDR>     Serve /metrics, /health and /status on address (e.g. 0.0.0.0:9090)
    --audit-log <PATH>        Enable audit logging to specified JSONL file
    -h, --help                Print this help message

CONSOLE (stdin):
    load <path> | start | stop | open <valve> | close <valve>
    cadence high|low | name <base> | connect | status | quit

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log filter (e.g., RUST_LOG=debug,stand_core=trace)

EXAMPLES:
    # Bench check against the simulator
    stand-ctl --simulate --script coldflow.csv --run-seconds 10

    # Hot fire with full observability
    stand-ctl --rig stand.json --modbus 192.168.1.10:502 --log-name hotfire \
        --json-logs --metrics-addr 0.0.0.0:9090 --audit-log /var/log/stand/audit.jsonl
"#
        );
    }
}

/// On-disk rig description: the rig itself plus the optional Modbus map.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StandFile {
    #[serde(flatten)]
    pub rig: RigSpec,
    #[serde(default)]
    pub modbus: Option<ModbusMap>,
}

impl StandFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadRig {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::ParseRig {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn build_rig(&self) -> Result<Rig, ConfigError> {
        Ok(Rig::from_spec(&self.rig)?)
    }

    pub fn modbus_map(&self) -> Result<ModbusMap, ConfigError> {
        self.modbus.clone().ok_or(ConfigError::MissingModbusMap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("stand-ctl")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn simulate_needs_nothing_else() {
        let cfg = RuntimeConfig::from_args(&args(&["--simulate"])).unwrap();
        assert!(cfg.simulate);
        assert_eq!(cfg.heartbeat, Duration::from_millis(200));
        assert_eq!(cfg.low_rate, Duration::from_millis(500));
        assert_eq!(cfg.log_name, "log");
    }

    #[test]
    fn parses_every_numeric_flag() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--simulate",
            "--heartbeat-ms",
            "50",
            "--failure-threshold",
            "3",
            "--high-rate-ms",
            "20",
            "--low-rate-ms",
            "250",
            "--queue-capacity",
            "64",
            "--run-seconds",
            "5",
        ]))
        .unwrap();
        assert_eq!(cfg.heartbeat, Duration::from_millis(50));
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.high_rate, Duration::from_millis(20));
        assert_eq!(cfg.low_rate, Duration::from_millis(250));
        assert_eq!(cfg.queue_capacity, 64);
        assert_eq!(cfg.run_seconds, Some(5));
    }

    #[test]
    fn hardware_needs_rig_and_address() {
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--modbus", "10.0.0.2:502"])),
            Err(ConfigError::MissingRig)
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--rig", "stand.json"])),
            Err(ConfigError::NoDevice)
        ));
        let cfg =
            RuntimeConfig::from_args(&args(&["--rig", "stand.json", "--modbus", "10.0.0.2:502"]))
                .unwrap();
        assert_eq!(cfg.modbus_addr, Some("10.0.0.2:502".parse().unwrap()));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--simulate", "--heartbeat-ms", "fast"])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--simulate", "--low-rate-ms", "0"])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--simulate", "--script"])),
            Err(ConfigError::MissingValue(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_args(&args(&["--simulate", "--bridge"])),
            Err(ConfigError::UnknownFlag(_))
        ));
    }

    #[test]
    fn help_skips_validation() {
        let cfg = RuntimeConfig::from_args(&args(&["-h"])).unwrap();
        assert!(cfg.show_help);
    }

    #[test]
    fn stand_file_with_modbus_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stand.json");
        std::fs::write(
            &path,
            r#"{
                "pressure": [{"name": "PT-OX-01", "channel": "AIN0",
                              "calibration": {"span": 5.0, "max_unit": 1000.0}}],
                "valves": [{"name": "SV-OX-01", "output": "FIO0"}],
                "modbus": {
                    "identity_register": 200,
                    "channels": {
                        "AIN0": {"kind": "input", "register": 0, "scale": 0.001},
                        "FIO0": {"kind": "holding", "register": 16}
                    }
                }
            }"#,
        )
        .unwrap();

        let stand = StandFile::load(&path).unwrap();
        let rig = stand.build_rig().unwrap();
        assert_eq!(rig.sensors().len(), 1);
        assert_eq!(stand.modbus_map().unwrap().identity_register, 200);
    }

    #[test]
    fn stand_file_without_map() {
        let stand: StandFile = serde_json::from_str(r#"{"valves": []}"#).unwrap();
        assert!(matches!(
            stand.modbus_map(),
            Err(ConfigError::MissingModbusMap)
        ));
    }
}
