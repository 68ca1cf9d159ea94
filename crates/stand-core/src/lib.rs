pub mod port;
pub mod record;
pub mod rig;
pub mod script;
mod script_proptest;
pub mod sensor;
pub mod sequencer;
#[cfg(feature = "simulation")]
pub mod sim;
pub mod supervisor;
pub mod valve;

pub use port::{Connector, DeviceLink, DevicePort, TransportError};
pub use record::{LogRecord, TIMESTAMP_FORMAT};
pub use rig::{Rig, RigError, RigSpec, SensorSpec, ValveSpec};
pub use script::{DeviceId, DeviceLimits, Event, Script, ScriptError};
pub use sensor::{Calibration, Sensor, SensorKind};
pub use sequencer::{
    CadenceControl, Phase, RunOutcome, RuntimeError, Sequencer, SequencerStatus, StartError, Tick,
    COOLDOWN,
};
#[cfg(feature = "simulation")]
pub use sim::{SimConnector, SimLink, SimulatedDaq};
pub use supervisor::{ConnectionStatus, ConnectionSupervisor};
pub use valve::{ActuationError, Valve};
