//! Script-driven valve sequencer.
//!
//! The engine never sleeps. `start` and `on_tick` return a [`Tick`] telling
//! the scheduler when to call back; the scheduler owns the single timer slot.

use crate::port::DeviceLink;
use crate::rig::Rig;
use crate::script::{DeviceId, Event, Script, ScriptError};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Time the logger stays at high cadence after the last event.
pub const COOLDOWN: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Armed,
    Running,
    CoolingDown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Stopped,
    Aborted(String),
}

/// What the scheduler should arm next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Call `on_tick` after the delay.
    After(Duration),
    /// Call `finish_cooldown` after the delay.
    Cooldown(Duration),
    /// Nothing pending.
    Idle,
}

/// Sampling cadence switch owned by the telemetry logger.
pub trait CadenceControl {
    fn is_high(&self) -> bool;
    fn request_cadence(&mut self, high: bool);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("no sequence file loaded")]
    NoScript,

    #[error("invalid sequence, check the sequence file")]
    InvalidScript,

    #[error("a sequence is already running")]
    AlreadyRunning,

    #[error("initial state mismatch for {device}: script expects {}, device is {}", state_name(.expected), state_name(.actual))]
    InitialStateMismatch {
        device: DeviceId,
        expected: bool,
        actual: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("pressure check failed: {device} at {actual} psi, minimum {min_psi} psi")]
    PressureInterlock {
        device: DeviceId,
        min_psi: f64,
        actual: f64,
    },

    #[error("{device} at {actual} psi exceeds redline {redline} psi")]
    RedlineExceeded {
        device: DeviceId,
        redline: f64,
        actual: f64,
    },

    #[error("event {index} is corrupt: {reason}")]
    CorruptEvent { index: usize, reason: String },

    #[error("device link lost before event {index}")]
    LinkLost { index: usize },
}

fn state_name(open: &bool) -> &'static str {
    if *open {
        "open"
    } else {
        "closed"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SequencerStatus {
    pub phase: Phase,
    pub last_outcome: Option<RunOutcome>,
    pub script_loaded: bool,
    pub faulty: bool,
    pub current_index: usize,
    pub event_count: usize,
}

#[derive(Debug, Default)]
pub struct Sequencer {
    script: Option<Script>,
    faulty: bool,
    phase: Phase,
    current_index: usize,
    restore_low_cadence: bool,
    trends: HashMap<DeviceId, Vec<f64>>,
    last_outcome: Option<RunOutcome>,
    cooldown: Option<Duration>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the post-run cooldown (defaults to [`COOLDOWN`]).
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running | Phase::CoolingDown)
    }

    pub fn is_faulty(&self) -> bool {
        self.faulty
    }

    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn last_outcome(&self) -> Option<&RunOutcome> {
        self.last_outcome.as_ref()
    }

    /// Pressure readings seen by CHECKPSI events in the current run.
    pub fn trend(&self, device: &str) -> &[f64] {
        self.trends.get(device).map_or(&[], Vec::as_slice)
    }

    pub fn status(&self) -> SequencerStatus {
        SequencerStatus {
            phase: self.phase,
            last_outcome: self.last_outcome.clone(),
            script_loaded: self.script.is_some(),
            faulty: self.faulty,
            current_index: self.current_index,
            event_count: self.script.as_ref().map_or(0, |s| s.events().len()),
        }
    }

    /// Parse and install a script. Its redlines replace any left on the rig
    /// by the previous script.
    ///
    /// Any failure marks the sequencer faulty until a good script loads.
    pub fn load(&mut self, source: &str, rig: &mut Rig) -> Result<&Script, ScriptError> {
        self.install(Script::parse_str(source), rig)
    }

    pub fn load_path(&mut self, path: &Path, rig: &mut Rig) -> Result<&Script, ScriptError> {
        self.install(Script::from_path(path), rig)
    }

    fn install(
        &mut self,
        parsed: Result<Script, ScriptError>,
        rig: &mut Rig,
    ) -> Result<&Script, ScriptError> {
        if self.is_running() {
            return Err(ScriptError::RunActive);
        }
        let script = match parsed.and_then(|script| check_devices(script, rig)) {
            Ok(script) => script,
            Err(e) => {
                log::error!("Sequence rejected: {e}");
                self.script = None;
                self.faulty = true;
                rig.clear_redlines();
                self.phase = Phase::Idle;
                return Err(e);
            }
        };
        rig.apply_limits(script.limits());
        log::info!(
            "Loaded sequence with {} devices and {} events",
            script.devices().len(),
            script.events().len()
        );
        self.faulty = false;
        self.phase = Phase::Armed;
        self.current_index = 0;
        Ok(self.script.insert(script))
    }

    /// Verify the initial state and begin a run.
    pub fn start(
        &mut self,
        rig: &Rig,
        cadence: &mut dyn CadenceControl,
    ) -> Result<Tick, StartError> {
        if self.is_running() {
            return Err(StartError::AlreadyRunning);
        }
        if self.faulty {
            return Err(StartError::InvalidScript);
        }
        let script = self.script.as_ref().ok_or(StartError::NoScript)?;
        if script.devices().is_empty() || script.events().is_empty() {
            return Err(StartError::InvalidScript);
        }

        let Some(Event::SetStates { states, .. }) = script.events().first() else {
            return Err(StartError::InvalidScript);
        };
        for (device, expected) in states {
            let actual = rig
                .valve(device)
                .map(|v| v.is_open())
                .ok_or(StartError::InvalidScript)?;
            if actual != *expected {
                log::error!("Sequencer is not prepared to start: mismatch for {device}");
                return Err(StartError::InitialStateMismatch {
                    device: device.clone(),
                    expected: *expected,
                    actual,
                });
            }
        }

        self.restore_low_cadence = !cadence.is_high();
        if self.restore_low_cadence {
            cadence.request_cadence(true);
        }
        self.current_index = 0;
        self.trends.clear();
        self.phase = Phase::Running;
        log::info!("Sequence started ({} events)", script.events().len());
        Ok(self.next_tick())
    }

    /// Fire the next event. Interlock trips stop the run before returning.
    pub fn on_tick(
        &mut self,
        rig: &mut Rig,
        link: &mut dyn DeviceLink,
        cadence: &mut dyn CadenceControl,
    ) -> Result<Tick, RuntimeError> {
        if self.phase != Phase::Running {
            log::debug!("Tick ignored: sequencer not running");
            return Ok(Tick::Idle);
        }
        let Some(script) = self.script.as_ref() else {
            self.phase = Phase::Idle;
            return Ok(Tick::Idle);
        };

        self.current_index += 1;
        let index = self.current_index;
        let Some(event) = script.events().get(index).cloned() else {
            self.phase = Phase::CoolingDown;
            return Ok(Tick::Cooldown(self.cooldown()));
        };

        if let Err(e) = self.fire(index, &event, rig, link) {
            self.abort(rig, link, cadence, &e);
            return Err(e);
        }
        Ok(self.next_tick())
    }

    /// End of cooldown: restore the previous cadence and tear the run down.
    pub fn finish_cooldown(
        &mut self,
        rig: &mut Rig,
        link: &mut dyn DeviceLink,
        cadence: &mut dyn CadenceControl,
    ) {
        if self.phase != Phase::CoolingDown {
            return;
        }
        self.restore_cadence(cadence);
        let events = self.script.as_ref().map_or(0, |s| s.events().len());
        self.teardown(rig, link);
        self.last_outcome = Some(RunOutcome::Completed);
        log::info!("Completed all {events} events");
    }

    /// Stop the run (if any), close every controlled valve and drop back to
    /// the cadence the run started from.
    pub fn stop(
        &mut self,
        rig: &mut Rig,
        link: &mut dyn DeviceLink,
        cadence: &mut dyn CadenceControl,
    ) {
        if self.is_running() {
            log::info!("Stopping sequencer at event {}", self.current_index);
            self.last_outcome = Some(RunOutcome::Stopped);
        }
        self.restore_cadence(cadence);
        self.teardown(rig, link);
    }

    fn fire(
        &mut self,
        index: usize,
        event: &Event,
        rig: &mut Rig,
        link: &mut dyn DeviceLink,
    ) -> Result<(), RuntimeError> {
        if let Some((device, redline, actual)) = rig.redline_breaches().into_iter().next() {
            return Err(RuntimeError::RedlineExceeded {
                device: device.to_string(),
                redline,
                actual,
            });
        }

        match event {
            Event::CheckPressure {
                device, min_psi, ..
            } => {
                let actual = rig.pressure(device).ok_or_else(|| RuntimeError::CorruptEvent {
                    index,
                    reason: format!("{device} is not a pressure sensor"),
                })?;
                self.trends.entry(device.clone()).or_default().push(actual);
                log::info!("Checking pressure of {device}: {actual} psi (min {min_psi})");
                if actual.is_nan() || actual < *min_psi {
                    return Err(RuntimeError::PressureInterlock {
                        device: device.clone(),
                        min_psi: *min_psi,
                        actual,
                    });
                }
            }
            Event::SetStates { states, .. } => {
                if !link.is_connected() {
                    return Err(RuntimeError::LinkLost { index });
                }
                for (device, open) in states {
                    let valve = rig.valve_mut(device).ok_or_else(|| RuntimeError::CorruptEvent {
                        index,
                        reason: format!("no valve named {device}"),
                    })?;
                    if let Err(e) = valve.set(link, *open) {
                        log::warn!("Event {index}: failed to drive {device}: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    fn next_tick(&mut self) -> Tick {
        let next = self
            .script
            .as_ref()
            .and_then(|s| s.events().get(self.current_index + 1))
            .map(Event::delay_ms);
        match next {
            Some(delay_ms) => {
                log::debug!("Next event scheduled in {delay_ms} ms");
                Tick::After(Duration::from_millis(delay_ms))
            }
            None => {
                self.phase = Phase::CoolingDown;
                Tick::Cooldown(self.cooldown())
            }
        }
    }

    fn abort(
        &mut self,
        rig: &mut Rig,
        link: &mut dyn DeviceLink,
        cadence: &mut dyn CadenceControl,
        error: &RuntimeError,
    ) {
        log::error!("Terminating sequence: {error}");
        self.restore_cadence(cadence);
        self.teardown(rig, link);
        self.last_outcome = Some(RunOutcome::Aborted(error.to_string()));
    }

    /// Undo the high-cadence request made by `start`, if it made one.
    fn restore_cadence(&mut self, cadence: &mut dyn CadenceControl) {
        if std::mem::take(&mut self.restore_low_cadence) {
            cadence.request_cadence(false);
        }
    }

    fn teardown(&mut self, rig: &mut Rig, link: &mut dyn DeviceLink) {
        let mut closed = 0;
        if let Some(script) = self.script.as_ref() {
            for device in script.devices() {
                let Some(valve) = rig.valve_mut(device) else {
                    continue;
                };
                if !valve.is_open() {
                    continue;
                }
                match valve.close(link) {
                    Ok(()) => closed += 1,
                    Err(e) => log::warn!("Failed to close {device}: {e}"),
                }
            }
        }
        log::info!("Closed {closed} open valves");
        self.trends.clear();
        self.phase = if self.script.is_some() {
            Phase::Armed
        } else {
            Phase::Idle
        };
    }

    fn cooldown(&self) -> Duration {
        self.cooldown.unwrap_or(COOLDOWN)
    }
}

fn check_devices(script: Script, rig: &Rig) -> Result<Script, ScriptError> {
    if let Some(unknown) = script.devices().iter().find(|d| rig.valve(d).is_none()) {
        return Err(ScriptError::UnknownDevice(unknown.clone()));
    }
    for event in script.events() {
        if let Event::CheckPressure { device, .. } = event {
            if !rig.is_pressure_sensor(device) {
                return Err(ScriptError::UnknownDevice(device.clone()));
            }
        }
    }
    Ok(script)
}
