use crate::runtime::status::StandStatus;
use stand_core::Phase;
use stand_io::metrics::{init_metrics, serve_metrics, LINK_CONNECTED, SEQUENCER_RUNNING};
use stand_io::StatusBoard;
use std::thread;
use tracing::info;

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(
    addr: &Option<String>,
    board: &StatusBoard,
) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone(), board.clone())
    })
}

/// Mirror the status document into the state gauges.
pub fn observe(status: &StandStatus) {
    LINK_CONNECTED.set(if status.connection.connected { 1.0 } else { 0.0 });
    let running = matches!(
        status.sequencer.phase,
        Phase::Running | Phase::CoolingDown
    );
    SEQUENCER_RUNNING.set(if running { 1.0 } else { 0.0 });
}
