//! Prometheus metrics for the test stand.
//!
//! Counters and gauges for the telemetry pipeline, the device link and the
//! sequencer, plus the HTTP exporter that also serves the status document.

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use serde::Serialize;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric definition is valid");
    if let Err(e) = REGISTRY.register(Box::new(counter.clone())) {
        tracing::warn!("Metric {} not registered: {}", name, e);
    }
    counter
}

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("metric definition is valid");
    if let Err(e) = REGISTRY.register(Box::new(gauge.clone())) {
        tracing::warn!("Metric {} not registered: {}", name, e);
    }
    gauge
}

// ============================================================================
// Telemetry Metrics
// ============================================================================

pub static SAMPLES_ENQUEUED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_samples_enqueued_total",
        "Samples accepted into the telemetry queue",
    )
});

/// Samples rejected because the queue was full or the writer was gone
pub static SAMPLES_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_samples_dropped_total",
        "Samples rejected by the telemetry queue",
    )
});

pub static ROWS_PERSISTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_rows_persisted_total",
        "Log rows written and synced to disk",
    )
});

pub static ROWS_LOST: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_rows_lost_total",
        "Log rows abandoned after the final flush failed",
    )
});

pub static FLUSH_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("stand_flush_failures_total", "Failed log flush attempts")
});

/// Sampling cadence (1 = high, 0 = low)
pub static CADENCE_HIGH: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "stand_cadence_high",
        "Sampling cadence (1=high, 0=low)",
    )
});

// ============================================================================
// Device Link Metrics
// ============================================================================

pub static LINK_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "stand_link_connected",
        "DAQ link status (1=connected, 0=disconnected)",
    )
});

pub static HEARTBEAT_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_heartbeat_failures_total",
        "Heartbeat ticks that failed to reach the DAQ",
    )
});

pub static SENSOR_READ_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_sensor_read_failures_total",
        "Sensor reads that returned NaN",
    )
});

// ============================================================================
// Sequencer Metrics
// ============================================================================

pub static RUNS_STARTED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("stand_runs_started_total", "Sequence runs started"));

pub static RUNS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_runs_completed_total",
        "Sequence runs that reached the end of the script",
    )
});

pub static RUNS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "stand_runs_aborted_total",
        "Sequence runs aborted by an interlock or link loss",
    )
});

pub static SEQUENCER_RUNNING: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "stand_sequencer_running",
        "Sequencer run active (1=running, 0=idle)",
    )
});

// ============================================================================
// Status Document
// ============================================================================

/// Latest status document, published by the scheduler and served at `/status`.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<String>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the document. Returns true when it changed.
    pub fn publish<T: Serialize>(&self, status: &T) -> bool {
        let json = match serde_json::to_string(status) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to encode status: {}", e);
                return false;
            }
        };
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if *current == json {
            return false;
        }
        *current = json;
        true
    }

    pub fn snapshot(&self) -> String {
        let current = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if current.is_empty() {
            "{}".to_string()
        } else {
            current.clone()
        }
    }
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

fn content_type(value: &str) -> Option<Header> {
    Header::from_bytes(&b"Content-Type"[..], value.as_bytes()).ok()
}

fn with_type<R: std::io::Read>(response: Response<R>, value: &str) -> Response<R> {
    match content_type(value) {
        Some(header) => response.with_header(header),
        None => response,
    }
}

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String, status: StatusBoard) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }
                    let response =
                        with_type(Response::from_data(buffer), "text/plain; version=0.0.4");
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/status" => {
                    let response =
                        with_type(Response::from_string(status.snapshot()), "application/json");
                    let _ = request.respond(response);
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = SAMPLES_ENQUEUED.get();
    let _ = SAMPLES_DROPPED.get();
    let _ = ROWS_PERSISTED.get();
    let _ = ROWS_LOST.get();
    let _ = FLUSH_FAILURES.get();
    let _ = CADENCE_HIGH.get();
    let _ = LINK_CONNECTED.get();
    let _ = HEARTBEAT_FAILURES.get();
    let _ = SENSOR_READ_FAILURES.get();
    let _ = RUNS_STARTED.get();
    let _ = RUNS_COMPLETED.get();
    let _ = RUNS_ABORTED.get();
    let _ = SEQUENCER_RUNNING.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct LinkState {
        connected: bool,
    }

    #[test]
    fn status_board_reports_changes() {
        let board = StatusBoard::new();
        assert_eq!(board.snapshot(), "{}");
        assert!(board.publish(&LinkState { connected: true }));
        assert!(!board.publish(&LinkState { connected: true }));
        assert_eq!(board.snapshot(), r#"{"connected":true}"#);
        assert!(board.publish(&LinkState { connected: false }));
    }

    #[test]
    fn registry_exports_stand_metrics() {
        init_metrics();
        RUNS_STARTED.inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "stand_runs_started_total"));
        assert!(names.iter().any(|n| n == "stand_link_connected"));
    }
}
