use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::console::Command;
use crate::runtime::status::{Cadence, StandStatus};
use crate::runtime::telemetry;
use serde_json::json;
use stand_core::{
    ActuationError, Connector, ConnectionSupervisor, DeviceLink, DevicePort, Rig, RunOutcome,
    RuntimeError, ScriptError, Sequencer, SimConnector, StartError, Tick, TransportError,
};
use stand_io::metrics::{
    HEARTBEAT_FAILURES, RUNS_ABORTED, RUNS_COMPLETED, RUNS_STARTED, SENSOR_READ_FAILURES,
};
use stand_io::{LoggerError, ModbusConnector, StatusBoard, TelemetryLogger};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// The device behind the supervisor.
pub enum StandConnector {
    Simulated(SimConnector),
    Modbus(ModbusConnector),
}

impl Connector for StandConnector {
    fn open(&mut self) -> Result<Box<dyn DevicePort>, TransportError> {
        match self {
            Self::Simulated(c) => c.open(),
            Self::Modbus(c) => c.open(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("a sequence is running; stop it first")]
    RunActive,

    #[error("no valve named {0}")]
    UnknownValve(String),

    #[error(transparent)]
    Actuation(#[from] ActuationError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Logger(#[from] LoggerError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What the scheduler should do after a command.
#[derive(Debug)]
pub enum Reply {
    Done,
    Timer(Tick),
    Status(Box<StandStatus>),
    Quit,
}

/// All control state, driven by one scheduler thread.
pub struct Stand<C: Connector = StandConnector> {
    rig: Rig,
    sequencer: Sequencer,
    link: ConnectionSupervisor<C>,
    logger: TelemetryLogger,
    audit: Option<Arc<AuditLogger>>,
    board: StatusBoard,
}

impl<C: Connector> Stand<C> {
    pub fn new(
        rig: Rig,
        sequencer: Sequencer,
        link: ConnectionSupervisor<C>,
        logger: TelemetryLogger,
        audit: Option<Arc<AuditLogger>>,
        board: StatusBoard,
    ) -> Self {
        Self {
            rig,
            sequencer,
            link,
            logger,
            audit,
            board,
        }
    }

    pub fn rig(&self) -> &Rig {
        &self.rig
    }

    pub fn logger(&self) -> &TelemetryLogger {
        &self.logger
    }

    pub fn audit(&self, event_type: AuditEventType, details: serde_json::Value) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_event(event_type, details) {
                warn!(error = %e, "Failed to write audit entry");
            }
        }
    }

    /// Open the device link and adopt the hardware valve states.
    pub fn connect(&mut self) -> Result<u64, CommandError> {
        let serial = self.link.connect()?;
        self.rig.sync_valves(&mut self.link);
        self.audit(AuditEventType::LinkUp, json!({ "serial": serial }));
        Ok(serial)
    }

    pub fn heartbeat(&mut self) {
        let failures_before = self.link.status().consecutive_failures;
        match self.link.heartbeat_tick() {
            Some(true) => {
                info!(serial = ?self.link.serial(), "DAQ link up");
                self.rig.sync_valves(&mut self.link);
                self.audit(AuditEventType::LinkUp, json!({ "serial": self.link.serial() }));
            }
            Some(false) => {
                let reason = self.link.status().last_error.clone();
                warn!(reason = ?reason, "DAQ link down");
                self.audit(AuditEventType::LinkDown, json!({ "reason": reason }));
            }
            None => {}
        }
        if self.link.status().consecutive_failures > failures_before {
            HEARTBEAT_FAILURES.inc();
        }
    }

    /// Read every sensor and queue one log record.
    pub fn sample(&mut self) {
        let failures = self.rig.acquire(&mut self.link);
        if failures > 0 && self.link.is_connected() {
            SENSOR_READ_FAILURES.inc_by(failures as u64);
        }
        self.logger.sample(&self.rig);
    }

    /// Sequencer timer expired.
    pub fn fire(&mut self) -> Tick {
        let fired = self
            .sequencer
            .on_tick(&mut self.rig, &mut self.link, &mut self.logger);
        match fired {
            Ok(Tick::Cooldown(delay)) => {
                debug!(cooldown_ms = delay.as_millis() as u64, "Last event fired");
                Tick::Cooldown(delay)
            }
            Ok(tick) => tick,
            Err(e) => {
                self.report_abort(&e);
                Tick::Idle
            }
        }
    }

    pub fn finish_cooldown(&mut self) {
        self.sequencer
            .finish_cooldown(&mut self.rig, &mut self.link, &mut self.logger);
        if self.sequencer.last_outcome() == Some(&RunOutcome::Completed) {
            RUNS_COMPLETED.inc();
            info!("Sequence completed");
            self.audit(
                AuditEventType::RunCompleted,
                json!({ "events": self.sequencer.status().event_count }),
            );
        }
    }

    pub fn execute(&mut self, command: Command) -> Result<Reply, CommandError> {
        match command {
            Command::Load(path) => {
                match self.sequencer.load_path(&path, &mut self.rig) {
                    Ok(script) => {
                        let details = json!({
                            "path": path.display().to_string(),
                            "devices": script.devices(),
                            "events": script.events().len(),
                        });
                        info!(path = %path.display(), "Sequence loaded");
                        self.audit(AuditEventType::ScriptLoaded, details);
                    }
                    Err(e) => {
                        self.audit(
                            AuditEventType::ScriptRejected,
                            json!({ "path": path.display().to_string(), "error": e.to_string() }),
                        );
                        return Err(e.into());
                    }
                }
                Ok(Reply::Done)
            }
            Command::Start => self.start().map(Reply::Timer),
            Command::Stop => {
                self.stop();
                Ok(Reply::Timer(Tick::Idle))
            }
            Command::Open(valve) => self.actuate(&valve, true).map(|()| Reply::Done),
            Command::Close(valve) => self.actuate(&valve, false).map(|()| Reply::Done),
            Command::Cadence { high } => {
                if self.sequencer.is_running() {
                    return Err(CommandError::RunActive);
                }
                let path = self.logger.set_cadence(high)?.display().to_string();
                self.audit(
                    AuditEventType::CadenceChange,
                    json!({ "cadence": Cadence::from_high(high), "file": path }),
                );
                Ok(Reply::Done)
            }
            Command::Name(base) => {
                self.logger.set_base_name(&base);
                info!(base = %self.logger.base_name(), "Log name set for the next file");
                Ok(Reply::Done)
            }
            Command::Connect => self.connect().map(|_| Reply::Done),
            Command::Status => Ok(Reply::Status(Box::new(self.status()))),
            Command::Quit => Ok(Reply::Quit),
        }
    }

    pub fn start(&mut self) -> Result<Tick, CommandError> {
        match self.sequencer.start(&self.rig, &mut self.logger) {
            Ok(tick) => {
                RUNS_STARTED.inc();
                self.audit(
                    AuditEventType::RunStarted,
                    json!({
                        "events": self.sequencer.status().event_count,
                        "log_file": self.logger.path().display().to_string(),
                    }),
                );
                Ok(tick)
            }
            Err(e) => {
                warn!(error = %e, "Sequence start refused");
                self.audit(AuditEventType::RunRejected, json!({ "error": e.to_string() }));
                Err(e.into())
            }
        }
    }

    pub fn stop(&mut self) {
        let was_running = self.sequencer.is_running();
        self.sequencer
            .stop(&mut self.rig, &mut self.link, &mut self.logger);
        if was_running {
            self.audit(
                AuditEventType::RunStopped,
                json!({ "index": self.sequencer.current_index() }),
            );
        }
    }

    fn actuate(&mut self, name: &str, open: bool) -> Result<(), CommandError> {
        if self.sequencer.is_running() {
            return Err(CommandError::RunActive);
        }
        let valve = self
            .rig
            .valve_mut(name)
            .ok_or_else(|| CommandError::UnknownValve(name.to_string()))?;
        valve.set(&mut self.link, open)?;
        info!(valve = name, open, "Manual actuation");
        self.audit(
            AuditEventType::ManualActuation,
            json!({ "valve": name, "open": open }),
        );
        Ok(())
    }

    fn report_abort(&mut self, e: &RuntimeError) {
        error!(error = %e, "Sequence aborted");
        RUNS_ABORTED.inc();
        let interlock = matches!(
            e,
            RuntimeError::PressureInterlock { .. } | RuntimeError::RedlineExceeded { .. }
        );
        if interlock {
            self.audit(AuditEventType::InterlockTrip, json!({ "error": e.to_string() }));
        }
        self.audit(
            AuditEventType::RunAborted,
            json!({ "reason": e.to_string(), "index": self.sequencer.current_index() }),
        );
    }

    pub fn status(&self) -> StandStatus {
        StandStatus {
            connection: self.link.status().clone(),
            sequencer: self.sequencer.status(),
            cadence: Cadence::from_high(self.logger.is_high()),
            log_file: self.logger.path().display().to_string(),
            samples_dropped: self.logger.stats().dropped(),
            open_valves: self
                .rig
                .open_valves()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Publish the status document; logs it when it changed.
    pub fn publish_status(&self) {
        let status = self.status();
        telemetry::observe(&status);
        if self.board.publish(&status) {
            debug!(status = %self.board.snapshot(), "Stand status changed");
        }
    }

    /// Close every valve, drain the logger and drop the link.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Err(e) = self.logger.stop() {
            warn!(error = %e, "Telemetry logger did not drain cleanly");
        }
        self.link.close();
        self.audit(
            AuditEventType::SystemShutdown,
            json!({
                "samples_enqueued": self.logger.stats().enqueued(),
                "rows_persisted": self.logger.stats().persisted(),
                "samples_dropped": self.logger.stats().dropped(),
            }),
        );
    }
}
