//! Telemetry logger: the scheduler enqueues samples, a background thread
//! batches them into CSV files.
//!
//! Each cadence switch rotates to a new file. The writer thread owns the
//! receiving half of the queue and hands it back when it exits, together
//! with any rows it could not persist, so both carry over to the next file.

use crate::metrics::{
    CADENCE_HIGH, FLUSH_FAILURES, ROWS_LOST, ROWS_PERSISTED, SAMPLES_DROPPED, SAMPLES_ENQUEUED,
};
use chrono::Local;
use stand_core::{CadenceControl, LogRecord, Rig};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BASE_NAME: &str = "log";
const FILE_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const FINAL_FLUSH_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to encode log rows: {0}")]
    Encode(String),

    #[error("log write failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to open log file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to write header to {}: {source}", path.display())]
    Header {
        path: PathBuf,
        source: PersistenceError,
    },

    #[error("writer for {} did not drain within {timeout_ms} ms; it keeps finishing in the background", path.display())]
    DrainTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("failed to start writer thread: {0}")]
    Spawn(io::Error),

    #[error("logger is stopped")]
    Stopped,
}

/// Destination of encoded rows. Files in production; tests inject failures.
pub trait LogSink: Send {
    /// Write a prefix of `data` and return how many bytes the sink took.
    fn write(&mut self, data: &[u8]) -> Result<usize, PersistenceError>;
    fn sync(&mut self) -> Result<(), PersistenceError>;
}

pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self { file }
    }
}

impl LogSink for FileSink {
    fn write(&mut self, data: &[u8]) -> Result<usize, PersistenceError> {
        loop {
            match self.file.write(data) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                written => return Ok(written?),
            }
        }
    }

    fn sync(&mut self) -> Result<(), PersistenceError> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

pub type SinkOpener = Box<dyn Fn(File) -> Box<dyn LogSink> + Send>;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub dir: PathBuf,
    pub base_name: String,
    pub high_rate: Duration,
    pub low_rate: Duration,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub recv_timeout: Duration,
    pub retry_backoff: Duration,
    pub drain_timeout: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            base_name: DEFAULT_BASE_NAME.to_string(),
            high_rate: Duration::from_millis(10),
            low_rate: Duration::from_millis(500),
            queue_capacity: 1_000_000,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            recv_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggerStats {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
    pub persisted: AtomicU64,
    pub flush_failures: AtomicU64,
}

impl LoggerStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }
}

/// Shutdown flag the writer can sleep on.
#[derive(Default)]
struct Shutdown {
    set: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    fn signal(&self) {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; returns early (true) once shutdown is signalled.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

struct WriterOptions {
    batch_size: usize,
    flush_interval: Duration,
    recv_timeout: Duration,
    retry_backoff: Duration,
}

impl From<&LoggerConfig> for WriterOptions {
    fn from(config: &LoggerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval,
            recv_timeout: config.recv_timeout,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// Rows taken off the queue that are not durable yet.
///
/// `chunk` is the encoded form of `inflight` and `written` counts the bytes
/// of it the sink already took, so a retry resumes where the last attempt
/// stopped instead of appending the same rows again.
#[derive(Default)]
struct Batch {
    queued: Vec<LogRecord>,
    inflight: Vec<LogRecord>,
    chunk: Vec<u8>,
    row_ends: Vec<usize>,
    written: usize,
}

impl Batch {
    fn from_records(queued: Vec<LogRecord>) -> Self {
        Self {
            queued,
            ..Self::default()
        }
    }

    fn push(&mut self, record: LogRecord) {
        self.queued.push(record);
    }

    fn extend(&mut self, records: impl IntoIterator<Item = LogRecord>) {
        self.queued.extend(records);
    }

    fn len(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write and sync everything held. Rows only leave the batch once the
    /// sink has synced them.
    fn flush(&mut self, sink: &mut dyn LogSink, stats: &LoggerStats) -> Result<(), PersistenceError> {
        loop {
            if self.inflight.is_empty() {
                if self.queued.is_empty() {
                    return Ok(());
                }
                let (chunk, row_ends) = encode_rows(self.queued.iter().map(LogRecord::to_row))?;
                self.chunk = chunk;
                self.row_ends = row_ends;
                self.written = 0;
                self.inflight = std::mem::take(&mut self.queued);
            }

            while self.written < self.chunk.len() {
                match sink.write(&self.chunk[self.written..])? {
                    0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                    n => self.written += n,
                }
            }
            sink.sync()?;

            let rows = self.inflight.len() as u64;
            stats.persisted.fetch_add(rows, Ordering::Relaxed);
            ROWS_PERSISTED.inc_by(rows);
            self.inflight.clear();
            self.chunk.clear();
            self.row_ends.clear();
            self.written = 0;
        }
    }

    /// Give up on this file. Rows the sink fully took are counted as
    /// persisted (their sync was never confirmed); every other row is
    /// returned for the next file. A row cut off mid-write leaves a fragment
    /// at the end of this file and is returned whole.
    fn into_unwritten(mut self, path: &Path, stats: &LoggerStats) -> Vec<LogRecord> {
        let written_rows = self.row_ends.partition_point(|&end| end <= self.written);
        if written_rows > 0 {
            stats.persisted.fetch_add(written_rows as u64, Ordering::Relaxed);
            ROWS_PERSISTED.inc_by(written_rows as u64);
            warn!(
                path = %path.display(),
                rows = written_rows,
                "Log rows written without a confirmed sync"
            );
        }
        let mut rest = self.inflight.split_off(written_rows);
        rest.append(&mut self.queued);
        rest
    }
}

struct Writer {
    path: PathBuf,
    shutdown: Arc<Shutdown>,
    done: Receiver<(Receiver<LogRecord>, Batch)>,
    handle: thread::JoinHandle<()>,
}

pub struct TelemetryLogger {
    config: LoggerConfig,
    header: Vec<String>,
    high: bool,
    tx: SyncSender<LogRecord>,
    writer: Option<Writer>,
    path: PathBuf,
    stats: Arc<LoggerStats>,
    opener: SinkOpener,
}

impl TelemetryLogger {
    /// Open the first (low-cadence) file and start the writer.
    pub fn new(config: LoggerConfig, header: Vec<String>) -> Result<Self, LoggerError> {
        Self::with_opener(config, header, Box::new(|file| Box::new(FileSink::new(file))))
    }

    pub fn with_opener(
        mut config: LoggerConfig,
        header: Vec<String>,
        opener: SinkOpener,
    ) -> Result<Self, LoggerError> {
        if config.base_name.trim().is_empty() {
            config.base_name = DEFAULT_BASE_NAME.to_string();
        }
        fs::create_dir_all(&config.dir).map_err(|source| LoggerError::CreateDir {
            path: config.dir.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::sync_channel(config.queue_capacity.max(1));
        let stats = Arc::new(LoggerStats::default());
        let (path, sink) = open_log(&config, false, &header, &opener)?;
        let writer = spawn_writer(
            path.clone(),
            rx,
            sink,
            Batch::default(),
            WriterOptions::from(&config),
            stats.clone(),
        )?;
        info!(path = %path.display(), "Telemetry logging to new file");
        CADENCE_HIGH.set(0.0);

        Ok(Self {
            config,
            header,
            high: false,
            tx,
            writer: Some(writer),
            path,
            stats,
            opener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_high(&self) -> bool {
        self.high
    }

    pub fn base_name(&self) -> &str {
        &self.config.base_name
    }

    pub fn stats(&self) -> &LoggerStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.writer.is_some()
    }

    /// Sampling period for the current cadence.
    pub fn sample_period(&self) -> Duration {
        if self.high {
            self.config.high_rate
        } else {
            self.config.low_rate
        }
    }

    /// Snapshot the rig and queue it. Never blocks; returns false when the
    /// sample was dropped.
    pub fn sample(&self, rig: &Rig) -> bool {
        self.enqueue(rig.record(Local::now().naive_local()))
    }

    pub fn enqueue(&self, record: LogRecord) -> bool {
        if self.writer.is_none() {
            self.count_drop("logger stopped");
            return false;
        }
        match self.tx.try_send(record) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                SAMPLES_ENQUEUED.inc();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.count_drop("sample queue full");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.count_drop("writer gone");
                false
            }
        }
    }

    /// Name used by the next rotation. Empty names fall back to `log`.
    pub fn set_base_name(&mut self, name: &str) {
        let name = name.trim();
        self.config.base_name = if name.is_empty() {
            DEFAULT_BASE_NAME.to_string()
        } else {
            name.to_string()
        };
        debug!(base = %self.config.base_name, "Log base name changed");
    }

    /// Switch sampling cadence and rotate to a new file.
    ///
    /// On `DrainTimeout` the switch has still happened: the new file is
    /// live and the old writer finishes its own queue in the background.
    pub fn set_cadence(&mut self, high: bool) -> Result<&Path, LoggerError> {
        let Some(old) = self.writer.take() else {
            return Err(LoggerError::Stopped);
        };
        if high == self.high {
            self.writer = Some(old);
            return Ok(&self.path);
        }

        let (path, sink) = match open_log(&self.config, high, &self.header, &self.opener) {
            Ok(opened) => opened,
            Err(e) => {
                self.writer = Some(old);
                return Err(e);
            }
        };

        let old_path = old.path.clone();
        let joined = join_writer(old, self.config.drain_timeout);
        let (rx, carried, outcome) = match joined {
            Some((rx, leftover)) => {
                let carried = leftover.into_unwritten(&old_path, &self.stats);
                if !carried.is_empty() {
                    warn!(
                        from = %old_path.display(),
                        rows = carried.len(),
                        "Unflushed log rows carried over to the new file"
                    );
                }
                (rx, carried, Ok(()))
            }
            None => {
                let (tx, rx) = mpsc::sync_channel(self.config.queue_capacity.max(1));
                self.tx = tx;
                let err = LoggerError::DrainTimeout {
                    path: old_path,
                    timeout_ms: duration_ms(self.config.drain_timeout),
                };
                warn!(error = %err, "Old log writer detached");
                (rx, Vec::new(), Err(err))
            }
        };

        let spawned = spawn_writer(
            path.clone(),
            rx,
            sink,
            Batch::from_records(carried),
            WriterOptions::from(&self.config),
            self.stats.clone(),
        );
        let writer = match spawned {
            Ok(writer) => writer,
            Err(e) => {
                error!(
                    path = %path.display(),
                    error = %e,
                    "Log writer could not be restarted; samples are dropped until the logger is rebuilt"
                );
                return Err(e);
            }
        };
        self.writer = Some(writer);
        self.path = path;
        self.high = high;
        CADENCE_HIGH.set(if high { 1.0 } else { 0.0 });
        info!(
            path = %self.path.display(),
            cadence = if high { "high" } else { "low" },
            period_ms = duration_ms(self.sample_period()),
            "Telemetry logging to new file"
        );
        outcome.map(|()| self.path.as_path())
    }

    /// Drain everything queued and stop the writer.
    pub fn stop(&mut self) -> Result<(), LoggerError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let path = writer.path.clone();
        match join_writer(writer, self.config.drain_timeout) {
            Some((_, leftover)) => {
                report_lost(&path, &leftover.into_unwritten(&path, &self.stats));
                info!(
                    path = %path.display(),
                    persisted = self.stats.persisted(),
                    dropped = self.stats.dropped(),
                    "Telemetry logger stopped"
                );
                Ok(())
            }
            None => Err(LoggerError::DrainTimeout {
                path,
                timeout_ms: duration_ms(self.config.drain_timeout),
            }),
        }
    }

    fn count_drop(&self, reason: &str) {
        let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        SAMPLES_DROPPED.inc();
        if dropped == 1 || dropped % 1000 == 0 {
            warn!(dropped, reason, "Telemetry sample dropped");
        }
    }
}

impl CadenceControl for TelemetryLogger {
    fn is_high(&self) -> bool {
        self.high
    }

    fn request_cadence(&mut self, high: bool) {
        if let Err(e) = self.set_cadence(high) {
            warn!(error = %e, "Cadence change incomplete");
        }
    }
}

impl Drop for TelemetryLogger {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Telemetry logger did not shut down cleanly");
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `<dir>/<base>_<high|low>_<stamp>.csv`, numbered when the name is taken.
fn open_log(
    config: &LoggerConfig,
    high: bool,
    header: &[String],
    opener: &SinkOpener,
) -> Result<(PathBuf, Box<dyn LogSink>), LoggerError> {
    let stem = format!(
        "{}_{}_{}",
        config.base_name,
        if high { "high" } else { "low" },
        Local::now().format(FILE_STAMP_FORMAT)
    );
    let mut suffix = 0u32;
    let (path, file) = loop {
        let name = if suffix == 0 {
            format!("{stem}.csv")
        } else {
            format!("{stem}_{suffix}.csv")
        };
        let path = config.dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => break (path, file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(source) => return Err(LoggerError::Open { path, source }),
        }
    };

    let mut sink = opener(file);
    let written = encode_rows(std::iter::once(header.to_vec()))
        .and_then(|(bytes, _)| write_all(sink.as_mut(), &bytes))
        .and_then(|()| sink.sync());
    if let Err(source) = written {
        return Err(LoggerError::Header { path, source });
    }
    Ok((path, sink))
}

/// CSV bytes plus the end offset of every row in them.
fn encode_rows(
    rows: impl IntoIterator<Item = Vec<String>>,
) -> Result<(Vec<u8>, Vec<usize>), PersistenceError> {
    let mut csv = csv::Writer::from_writer(Vec::new());
    let mut row_ends = Vec::new();
    for row in rows {
        csv.write_record(&row)
            .map_err(|e| PersistenceError::Encode(e.to_string()))?;
        csv.flush()?;
        row_ends.push(csv.get_ref().len());
    }
    let bytes = csv
        .into_inner()
        .map_err(|e| PersistenceError::Encode(e.to_string()))?;
    Ok((bytes, row_ends))
}

fn write_all(sink: &mut dyn LogSink, mut data: &[u8]) -> Result<(), PersistenceError> {
    while !data.is_empty() {
        match sink.write(data)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            n => data = &data[n.min(data.len())..],
        }
    }
    Ok(())
}

fn report_lost(path: &Path, lost: &[LogRecord]) {
    if lost.is_empty() {
        return;
    }
    ROWS_LOST.inc_by(lost.len() as u64);
    error!(path = %path.display(), lost = lost.len(), "Log rows could not be persisted");
}

fn spawn_writer(
    path: PathBuf,
    rx: Receiver<LogRecord>,
    sink: Box<dyn LogSink>,
    carried: Batch,
    options: WriterOptions,
    stats: Arc<LoggerStats>,
) -> Result<Writer, LoggerError> {
    let shutdown = Arc::new(Shutdown::default());
    let (done_tx, done) = mpsc::channel();
    let thread_shutdown = shutdown.clone();
    let thread_path = path.clone();
    let handle = thread::Builder::new()
        .name("telemetry-writer".to_string())
        .spawn(move || {
            let finished = run_writer(&thread_path, rx, sink, carried, &options, &thread_shutdown, &stats);
            // Nobody waits for a detached writer; its leftovers stop here.
            if let Err(mpsc::SendError((_, leftover))) = done_tx.send(finished) {
                report_lost(&thread_path, &leftover.into_unwritten(&thread_path, &stats));
            }
        })
        .map_err(LoggerError::Spawn)?;
    Ok(Writer {
        path,
        shutdown,
        done,
        handle,
    })
}

/// Signal the writer and wait for it to hand back the queue and whatever
/// it could not persist.
fn join_writer(writer: Writer, timeout: Duration) -> Option<(Receiver<LogRecord>, Batch)> {
    writer.shutdown.signal();
    match writer.done.recv_timeout(timeout) {
        Ok(finished) => {
            if writer.handle.join().is_err() {
                error!(path = %writer.path.display(), "Log writer panicked");
            }
            Some(finished)
        }
        Err(_) => None,
    }
}

fn run_writer(
    path: &Path,
    rx: Receiver<LogRecord>,
    mut sink: Box<dyn LogSink>,
    mut batch: Batch,
    options: &WriterOptions,
    shutdown: &Shutdown,
    stats: &LoggerStats,
) -> (Receiver<LogRecord>, Batch) {
    // Rows carried over from the previous file go out first.
    let mut flush_now = !batch.is_empty();
    let mut last_flush = Instant::now();
    debug!(path = %path.display(), carried = batch.len(), "Log writer started");

    loop {
        if shutdown.is_set() {
            batch.extend(rx.try_iter());
            final_flush(path, sink.as_mut(), &mut batch, options, stats);
            break;
        }

        match rx.recv_timeout(options.recv_timeout) {
            Ok(record) => batch.push(record),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                final_flush(path, sink.as_mut(), &mut batch, options, stats);
                break;
            }
        }

        let due = flush_now
            || batch.len() >= options.batch_size
            || last_flush.elapsed() >= options.flush_interval;
        if !due || batch.is_empty() {
            continue;
        }
        match batch.flush(sink.as_mut(), stats) {
            Ok(()) => {
                flush_now = false;
                last_flush = Instant::now();
            }
            Err(e) => {
                stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                FLUSH_FAILURES.inc();
                warn!(
                    path = %path.display(),
                    pending = batch.len(),
                    error = %e,
                    "Log flush failed, retrying"
                );
                shutdown.wait(options.retry_backoff);
            }
        }
    }

    debug!(path = %path.display(), "Log writer finished");
    (rx, batch)
}

/// Last attempts before the writer exits. Whatever is still unwritten stays
/// in the batch for the caller.
fn final_flush(
    path: &Path,
    sink: &mut dyn LogSink,
    batch: &mut Batch,
    options: &WriterOptions,
    stats: &LoggerStats,
) {
    for attempt in 1..=FINAL_FLUSH_ATTEMPTS {
        if batch.is_empty() {
            return;
        }
        match batch.flush(sink, stats) {
            Ok(()) => return,
            Err(e) => {
                stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                FLUSH_FAILURES.inc();
                warn!(path = %path.display(), attempt, error = %e, "Final log flush failed");
                thread::sleep(options.retry_backoff.min(Duration::from_millis(100)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::AtomicU32;

    fn config(dir: &Path) -> LoggerConfig {
        LoggerConfig {
            dir: dir.to_path_buf(),
            base_name: "hotfire".to_string(),
            recv_timeout: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
            ..LoggerConfig::default()
        }
    }

    fn header() -> Vec<String> {
        vec![
            "Timestamp".to_string(),
            "PT-OX-01 Pressure".to_string(),
            "SV-OX-01 State".to_string(),
        ]
    }

    fn record(n: u32) -> LogRecord {
        LogRecord {
            timestamp: NaiveDate::from_ymd_opt(2025, 6, 1)
                .unwrap()
                .and_hms_micro_opt(10, 0, 0, n)
                .unwrap(),
            pressures: vec![f64::from(n)],
            temperatures: vec![],
            loads: vec![],
            valve_states: vec![n % 2 == 0],
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn rows_match_samples_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TelemetryLogger::new(config(dir.path()), header()).unwrap();
        for n in 0..250 {
            assert!(logger.enqueue(record(n)));
        }
        let path = logger.path().to_path_buf();
        logger.stop().unwrap();

        let lines = lines(&path);
        assert_eq!(lines.len(), 251);
        assert_eq!(lines[0], "Timestamp,PT-OX-01 Pressure,SV-OX-01 State");
        assert_eq!(lines[1], "2025-06-01 10:00:00.000000,0,true");
        assert_eq!(logger.stats().persisted(), 250);
        assert!(!logger.enqueue(record(0)));
    }

    #[test]
    fn file_name_layout() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TelemetryLogger::new(config(dir.path()), header()).unwrap();
        let name = logger.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("hotfire_low_"), "{name}");
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "hotfire_low_20250601_100000.csv".len());
    }

    #[test]
    fn cadence_switch_splits_rows_between_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TelemetryLogger::new(config(dir.path()), header()).unwrap();
        for n in 0..40 {
            logger.enqueue(record(n));
        }
        let low = logger.path().to_path_buf();
        let high = logger.set_cadence(true).unwrap().to_path_buf();
        assert_ne!(low, high);
        assert!(logger.is_high());
        assert_eq!(logger.sample_period(), Duration::from_millis(10));
        for n in 40..100 {
            logger.enqueue(record(n));
        }
        logger.stop().unwrap();

        let low_rows = lines(&low);
        let high_rows = lines(&high);
        assert_eq!(low_rows.len() - 1 + high_rows.len() - 1, 100);
        assert_eq!(low_rows.len() - 1, 40);
        assert_eq!(high_rows[0], low_rows[0]);
        assert!(high
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("hotfire_high_"));
    }

    #[test]
    fn same_cadence_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TelemetryLogger::new(config(dir.path()), header()).unwrap();
        let before = logger.path().to_path_buf();
        assert_eq!(logger.set_cadence(false).unwrap(), before);
    }

    #[test]
    fn taken_names_get_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.base_name = "  ".to_string();
        let first = TelemetryLogger::new(cfg.clone(), header()).unwrap();
        let second = TelemetryLogger::new(cfg, header()).unwrap();
        assert_ne!(first.path(), second.path());
        let name = first.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("log_low_"), "{name}");
    }

    #[test]
    fn base_name_applies_on_next_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TelemetryLogger::new(config(dir.path()), header()).unwrap();
        logger.set_base_name("coldflow");
        let path = logger.set_cadence(true).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("coldflow_high_"), "{name}");
        logger.set_base_name("");
        assert_eq!(logger.base_name(), DEFAULT_BASE_NAME);
    }

    struct FlakySink {
        inner: FileSink,
        failures: Arc<AtomicU32>,
    }

    impl LogSink for FlakySink {
        fn write(&mut self, data: &[u8]) -> Result<usize, PersistenceError> {
            let left = self.failures.load(Ordering::SeqCst);
            // The header always goes through.
            if left > 0 && !data.starts_with(b"Timestamp") {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::Other, "disk full").into());
            }
            self.inner.write(data)
        }

        fn sync(&mut self) -> Result<(), PersistenceError> {
            self.inner.sync()
        }
    }

    #[test]
    fn failed_flush_is_retried_without_loss() {
        let dir = tempfile::tempdir().unwrap();
        let failures = Arc::new(AtomicU32::new(2));
        let counter = failures.clone();
        let mut cfg = config(dir.path());
        cfg.batch_size = 10;
        let mut logger = TelemetryLogger::with_opener(
            cfg,
            header(),
            Box::new(move |file| {
                Box::new(FlakySink {
                    inner: FileSink::new(file),
                    failures: counter.clone(),
                })
            }),
        )
        .unwrap();
        for n in 0..30 {
            logger.enqueue(record(n));
        }
        thread::sleep(Duration::from_millis(200));
        let path = logger.path().to_path_buf();
        logger.stop().unwrap();

        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(logger.stats().flush_failures() >= 2);
        assert_eq!(lines(&path).len(), 31);
    }

    struct SlowSink {
        inner: FileSink,
        delay: Duration,
    }

    impl LogSink for SlowSink {
        fn write(&mut self, data: &[u8]) -> Result<usize, PersistenceError> {
            if !data.starts_with(b"Timestamp") {
                thread::sleep(self.delay);
            }
            self.inner.write(data)
        }

        fn sync(&mut self) -> Result<(), PersistenceError> {
            self.inner.sync()
        }
    }

    #[test]
    fn slow_drain_detaches_old_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.drain_timeout = Duration::from_millis(20);
        let mut logger = TelemetryLogger::with_opener(
            cfg,
            header(),
            Box::new(|file| {
                Box::new(SlowSink {
                    inner: FileSink::new(file),
                    delay: Duration::from_millis(300),
                })
            }),
        )
        .unwrap();
        for n in 0..5 {
            logger.enqueue(record(n));
        }
        let low = logger.path().to_path_buf();

        let err = logger.set_cadence(true).unwrap_err();
        assert!(matches!(err, LoggerError::DrainTimeout { .. }));
        assert!(logger.is_high());
        let high = logger.path().to_path_buf();
        assert_ne!(low, high);

        logger.enqueue(record(99));
        // The detached writer needs one slow flush; the new one needs one too.
        thread::sleep(Duration::from_millis(400));
        let _ = logger.stop();
        thread::sleep(Duration::from_millis(400));

        assert_eq!(lines(&low).len(), 6);
        let high_rows = lines(&high);
        assert_eq!(high_rows.len(), 2);
        assert!(high_rows[1].ends_with(",99,false"));
    }

    /// Passes the header, then fails the next `failures` syncs.
    struct SyncFailSink {
        inner: FileSink,
        synced_header: bool,
        failures: u32,
    }

    impl LogSink for SyncFailSink {
        fn write(&mut self, data: &[u8]) -> Result<usize, PersistenceError> {
            self.inner.write(data)
        }

        fn sync(&mut self) -> Result<(), PersistenceError> {
            if self.synced_header && self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "EIO").into());
            }
            self.synced_header = true;
            self.inner.sync()
        }
    }

    #[test]
    fn failed_sync_does_not_rewrite_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.batch_size = 10;
        let mut logger = TelemetryLogger::with_opener(
            cfg,
            header(),
            Box::new(|file| {
                Box::new(SyncFailSink {
                    inner: FileSink::new(file),
                    synced_header: false,
                    failures: 1,
                })
            }),
        )
        .unwrap();
        for n in 0..10 {
            logger.enqueue(record(n));
        }
        thread::sleep(Duration::from_millis(200));
        let path = logger.path().to_path_buf();
        logger.stop().unwrap();

        assert!(logger.stats().flush_failures() >= 1);
        assert_eq!(logger.stats().persisted(), 10);
        let lines = lines(&path);
        assert_eq!(lines.len(), 11);
        let unique: std::collections::HashSet<_> = lines.iter().collect();
        assert_eq!(unique.len(), 11);
    }

    /// Takes at most 64 bytes per call and fails every third call.
    struct ChoppySink {
        inner: FileSink,
        calls: u32,
    }

    impl LogSink for ChoppySink {
        fn write(&mut self, data: &[u8]) -> Result<usize, PersistenceError> {
            if data.starts_with(b"Timestamp") {
                return self.inner.write(data);
            }
            self.calls += 1;
            if self.calls % 3 == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "short write").into());
            }
            self.inner.write(&data[..data.len().min(64)])
        }

        fn sync(&mut self) -> Result<(), PersistenceError> {
            self.inner.sync()
        }
    }

    #[test]
    fn partial_writes_resume_where_they_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.retry_backoff = Duration::from_millis(1);
        cfg.flush_interval = Duration::from_millis(10);
        let mut logger = TelemetryLogger::with_opener(
            cfg,
            header(),
            Box::new(|file| {
                Box::new(ChoppySink {
                    inner: FileSink::new(file),
                    calls: 0,
                })
            }),
        )
        .unwrap();
        for n in 0..20 {
            logger.enqueue(record(n));
        }
        let path = logger.path().to_path_buf();
        thread::sleep(Duration::from_millis(500));
        logger.stop().unwrap();

        let lines = lines(&path);
        assert_eq!(lines.len(), 21);
        for (n, line) in lines[1..].iter().enumerate() {
            let expected = format!(
                "2025-06-01 10:00:00.{:06},{},{}",
                n,
                n,
                n % 2 == 0
            );
            assert_eq!(line, &expected);
        }
    }

    /// Refuses every data write while the shared flag is set.
    struct BrokenSink {
        inner: FileSink,
        broken: Arc<std::sync::atomic::AtomicBool>,
    }

    impl LogSink for BrokenSink {
        fn write(&mut self, data: &[u8]) -> Result<usize, PersistenceError> {
            if self.broken.load(Ordering::SeqCst) && !data.starts_with(b"Timestamp") {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full").into());
            }
            self.inner.write(data)
        }

        fn sync(&mut self) -> Result<(), PersistenceError> {
            self.inner.sync()
        }
    }

    #[test]
    fn rotation_carries_unflushed_rows_into_the_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let broken = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = broken.clone();
        let mut cfg = config(dir.path());
        cfg.batch_size = 1;
        let mut logger = TelemetryLogger::with_opener(
            cfg,
            header(),
            Box::new(move |file| {
                Box::new(BrokenSink {
                    inner: FileSink::new(file),
                    broken: flag.clone(),
                })
            }),
        )
        .unwrap();
        for n in 0..5 {
            logger.enqueue(record(n));
        }
        thread::sleep(Duration::from_millis(50));
        let low = logger.path().to_path_buf();
        let high = logger.set_cadence(true).unwrap().to_path_buf();

        broken.store(false, Ordering::SeqCst);
        for n in 5..8 {
            logger.enqueue(record(n));
        }
        thread::sleep(Duration::from_millis(100));
        logger.stop().unwrap();

        assert_eq!(lines(&low).len(), 1);
        let high_rows = lines(&high);
        assert_eq!(high_rows.len(), 9);
        assert!(high_rows[1].ends_with(",0,true"));
        assert!(high_rows[8].ends_with(",7,false"));
        assert_eq!(logger.stats().persisted(), 8);
    }
}
