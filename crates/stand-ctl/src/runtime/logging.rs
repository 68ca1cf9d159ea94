use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info,stand_ctl=debug,stand_io=debug,stand_core=debug";

/// Initialize the tracing subscriber with optional JSON output.
///
/// `stand-core` logs through the `log` facade; the subscriber's log bridge
/// picks those records up as well. With a diagnostics directory, a second
/// JSON layer writes to a daily rolling file; keep the returned guard alive
/// until exit so buffered lines are flushed.
pub fn init_tracing(json_output: bool, diagnostics_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let console = if json_output {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().pretty().boxed()
    };

    let (diagnostics, guard) = match diagnostics_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "stand-ctl.jsonl");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(diagnostics)
        .try_init()
    {
        eprintln!("tracing already initialized: {e}");
    }
    guard
}
