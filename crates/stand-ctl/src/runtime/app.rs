use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::{ConfigError, RuntimeConfig, StandFile};
use crate::runtime::console::Command;
use crate::runtime::logging::init_tracing;
use crate::runtime::stand::{Reply, Stand, StandConnector};
use crate::runtime::telemetry;
use serde_json::json;
use stand_core::{
    Calibration, ConnectionSupervisor, Rig, Sensor, SensorKind, Sequencer, SimulatedDaq, Tick,
    Valve,
};
use stand_io::{LoggerConfig, LoggerError, ModbusConfig, ModbusConnector, StatusBoard, TelemetryLogger};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logger(#[from] LoggerError),

    #[error("failed to open audit log {}: {source}", path.display())]
    Audit {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start scheduler: {0}")]
    Scheduler(std::io::Error),
}

pub fn run_from_args() -> Result<(), AppError> {
    let config = RuntimeConfig::from_env()?;
    if config.show_help {
        RuntimeConfig::print_help();
        return Ok(());
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _diagnostics = init_tracing(config.json_logs, config.diagnostics_dir.as_deref());

    telemetry::init();
    let board = StatusBoard::new();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr, &board);

    let audit = init_audit_logger(config.audit_path.as_ref())?;
    let (rig, connector) = build_rig(&config)?;

    let logger = TelemetryLogger::new(
        LoggerConfig {
            dir: config.log_dir.clone(),
            base_name: config.log_name.clone(),
            high_rate: config.high_rate,
            low_rate: config.low_rate,
            queue_capacity: config.queue_capacity,
            ..LoggerConfig::default()
        },
        rig.log_header(),
    )?;

    let link = ConnectionSupervisor::new(connector).with_failure_threshold(config.failure_threshold);
    let mut stand = Stand::new(rig, Sequencer::new(), link, logger, audit, board);
    stand.audit(
        AuditEventType::SystemStart,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "simulate": config.simulate,
            "sensors": stand.rig().sensors().len(),
            "valves": stand.rig().valves().len(),
            "log_file": stand.logger().path().display().to_string(),
        }),
    );

    info!(
        sensors = stand.rig().sensors().len(),
        valves = stand.rig().valves().len(),
        heartbeat_ms = config.heartbeat.as_millis() as u64,
        "Starting test stand controller"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(AppError::Scheduler)?;
    runtime.block_on(schedule(&mut stand, &config));

    stand.shutdown();
    info!(
        rows_persisted = stand.logger().stats().persisted(),
        samples_dropped = stand.logger().stats().dropped(),
        "Run complete"
    );
    Ok(())
}

fn init_audit_logger(audit_path: Option<&PathBuf>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = audit_path else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path).map_err(|source| AppError::Audit {
        path: path.clone(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}

fn build_rig(config: &RuntimeConfig) -> Result<(Rig, StandConnector), ConfigError> {
    let stand_file = config.rig_path.as_deref().map(StandFile::load).transpose()?;

    if config.simulate {
        let rig = match &stand_file {
            Some(file) => file.build_rig()?,
            None => demo_rig()?,
        };
        let daq = SimulatedDaq::new(470_010_000);
        prime_simulator(&daq, &rig);
        info!("Using simulated DAQ");
        return Ok((rig, StandConnector::Simulated(daq.connector())));
    }

    let file = stand_file.ok_or(ConfigError::MissingRig)?;
    let addr = config.modbus_addr.ok_or(ConfigError::NoDevice)?;
    let rig = file.build_rig()?;
    let connector = ModbusConnector::new(ModbusConfig {
        addr,
        map: file.modbus_map()?,
        timeout: config.modbus_timeout,
    });
    info!(addr = %addr, "Using Modbus TCP DAQ");
    Ok((rig, StandConnector::Modbus(connector)))
}

/// Bench rig used by `--simulate` without a rig file.
fn demo_rig() -> Result<Rig, ConfigError> {
    let transducer = Calibration {
        scalar: 1.0,
        offset: 0.5,
        span: 4.0,
        max_unit: 1000.0,
        linear_offset: 0.0,
    };
    let thermocouple = Calibration {
        scalar: 1.0,
        offset: 0.0,
        span: 0.05,
        max_unit: 1250.0,
        linear_offset: 0.0,
    };
    let load_cell = Calibration {
        scalar: 1.0,
        offset: 0.0,
        span: 0.02,
        max_unit: 500.0,
        linear_offset: 0.0,
    };
    Ok(Rig::new(
        vec![
            Sensor::new("PT-OX-01", SensorKind::Pressure, "AIN0", None, transducer),
            Sensor::new("PT-FU-01", SensorKind::Pressure, "AIN1", None, transducer),
            Sensor::new("TC-01", SensorKind::Temperature, "AIN4", None, thermocouple),
            Sensor::new("LC-01", SensorKind::Load, "AIN2", Some("AIN3".to_string()), load_cell),
        ],
        vec![
            Valve::new("SV-OX-01", "FIO0", false),
            Valve::new("SV-FU-01", "FIO1", false),
            Valve::new("SV-N2-01", "FIO2", true),
        ],
    )?)
}

/// Plausible bench readings, with every valve output at its closed level.
fn prime_simulator(daq: &SimulatedDaq, rig: &Rig) {
    for (channel, volts) in [("AIN0", 2.5), ("AIN1", 2.0), ("AIN4", 0.001), ("AIN2", 0.0), ("AIN3", 0.0)] {
        daq.set_channel(channel, volts);
    }
    for valve in rig.valves() {
        daq.set_channel(valve.output(), if valve.normally_open() { 0.0 } else { 1.0 });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Event,
    Cooldown,
}

/// The single sequencer timer slot. Arming replaces whatever was pending.
struct SequenceTimer {
    sleep: Pin<Box<Sleep>>,
    pending: Option<Pending>,
}

impl SequenceTimer {
    fn new() -> Self {
        Self {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            pending: None,
        }
    }

    fn arm(&mut self, tick: Tick) {
        let (pending, delay) = match tick {
            Tick::After(delay) => (Some(Pending::Event), delay),
            Tick::Cooldown(delay) => (Some(Pending::Cooldown), delay),
            Tick::Idle => (None, Duration::ZERO),
        };
        self.pending = pending;
        self.sleep.as_mut().reset(Instant::now() + delay);
    }
}

fn sampler(period: Duration) -> Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn schedule(stand: &mut Stand, config: &RuntimeConfig) {
    let mut timer = SequenceTimer::new();
    let mut heartbeat = sampler(config.heartbeat);
    let mut sample_period = stand.logger().sample_period();
    let mut sampling = sampler(sample_period);

    let mut console = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    let deadline = config
        .run_seconds
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let run_deadline = time::sleep_until(deadline.unwrap_or_else(Instant::now));
    tokio::pin!(run_deadline);

    if let Err(e) = stand.connect() {
        warn!(error = %e, "DAQ not reachable at startup; heartbeat will keep retrying");
    }
    if let Some(path) = config.script_path.clone() {
        if let Err(e) = stand.execute(Command::Load(path)) {
            warn!(error = %e, "Startup script rejected");
        }
    }
    if config.auto_start {
        match stand.start() {
            Ok(tick) => timer.arm(tick),
            Err(e) => warn!(error = %e, "Auto-start failed"),
        }
    }
    stand.publish_status();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => stand.heartbeat(),
            _ = sampling.tick() => stand.sample(),
            _ = &mut timer.sleep, if timer.pending.is_some() => {
                match timer.pending.take() {
                    Some(Pending::Event) => {
                        let next = stand.fire();
                        timer.arm(next);
                    }
                    Some(Pending::Cooldown) => stand.finish_cooldown(),
                    None => {}
                }
            }
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => {
                    let Some(parsed) = Command::parse(&line) else {
                        continue;
                    };
                    let reply = parsed
                        .map_err(|e| e.to_string())
                        .and_then(|command| stand.execute(command).map_err(|e| e.to_string()));
                    match reply {
                        Ok(Reply::Done) => {}
                        Ok(Reply::Timer(tick)) => timer.arm(tick),
                        Ok(Reply::Status(status)) => match serde_json::to_string_pretty(&status) {
                            Ok(json) => println!("{json}"),
                            Err(e) => warn!(error = %e, "Failed to encode status"),
                        },
                        Ok(Reply::Quit) => {
                            info!("Operator requested shutdown");
                            break;
                        }
                        Err(e) => warn!(command = %line.trim(), error = %e, "Command failed"),
                    }
                }
                Ok(None) => {
                    info!("Console closed");
                    console_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Console read failed");
                    console_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut run_deadline, if deadline.is_some() => {
                info!(seconds = config.run_seconds, "Run time elapsed");
                break;
            }
        }

        let period = stand.logger().sample_period();
        if period != sample_period {
            sample_period = period;
            sampling = sampler(period);
        }
        stand.publish_status();
    }
}
