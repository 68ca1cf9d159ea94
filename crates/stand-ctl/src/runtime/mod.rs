mod app;
mod config;
mod console;
mod logging;
mod stand;
mod status;
mod telemetry;

pub use app::run_from_args;
