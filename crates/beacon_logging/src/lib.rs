//! Logging setup for Beacon binaries.
//!
//! Tracing output goes to stderr and to a size-capped file under
//! `$BEACON_HOME/logs`. When the active file fills up it is sealed under
//! a timestamped name and a fresh one is started; the oldest sealed
//! files are pruned so a long-running runner cannot fill the disk.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "beacon_runner=info,beacon_db=info,beacon_transparency=info";

/// Size at which the active log file is sealed.
const ROLL_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Sealed files kept per binary.
const KEEP_SEALED: usize = 4;

/// Logging configuration shared by Beacon binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a rolling file sink and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let sink = LogSink::open(&dir, config.app_name, ROLL_AT_BYTES, KEEP_SEALED)
        .with_context(|| format!("Failed to open log sink in {}", dir.display()))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(sink)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Get the Beacon home directory: ~/.beacon
pub fn beacon_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("BEACON_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".beacon")
}

/// Get the logs directory: ~/.beacon/logs
pub fn logs_dir() -> PathBuf {
    beacon_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Cloneable handle to one shared log file.
///
/// All clones append through the same state, so the size check, the
/// seal, and the prune are atomic with respect to concurrent writers.
/// The active file is always `<name>.log`; sealed files carry the epoch
/// timestamp of the roll, which makes their names sort oldest-first.
#[derive(Clone)]
pub struct LogSink {
    shared: Arc<Mutex<SinkState>>,
}

struct SinkState {
    dir: PathBuf,
    name: String,
    file: File,
    written: u64,
    roll_at: u64,
    keep_sealed: usize,
}

impl LogSink {
    pub fn open(dir: &Path, app_name: &str, roll_at: u64, keep_sealed: usize) -> io::Result<Self> {
        // Path separators and other shell noise are dropped, not mapped.
        let name: String = app_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let name = if name.is_empty() {
            "beacon".to_string()
        } else {
            name
        };

        let active = dir.join(format!("{name}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&active)?;
        let written = file.metadata()?.len();

        Ok(Self {
            shared: Arc::new(Mutex::new(SinkState {
                dir: dir.to_path_buf(),
                name,
                file,
                written,
                roll_at: roll_at.max(1),
                keep_sealed,
            })),
        })
    }
}

impl SinkState {
    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Seal before the write that would cross the cap, so one record
        // never straddles two files.
        if self.written > 0 && self.written + buf.len() as u64 > self.roll_at {
            self.seal()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    /// Rename the active file to a timestamped sealed name and start a
    /// fresh one, then prune old sealed files.
    fn seal(&mut self) -> io::Result<()> {
        self.file.flush()?;

        // Nanosecond stamps keep sealed names unique and, at a fixed
        // digit width for the foreseeable future, sorting oldest-first.
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut sealed = self.dir.join(format!("{}-{stamp}.log", self.name));
        let mut counter = 1;
        while sealed.exists() {
            sealed = self.dir.join(format!("{}-{stamp}.{counter}.log", self.name));
            counter += 1;
        }
        fs::rename(self.active_path(), &sealed)?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = 0;

        self.prune();
        Ok(())
    }

    /// Remove the oldest sealed files beyond the keep limit. Best effort:
    /// logging never fails because housekeeping did.
    fn prune(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let marker = format!("{}-", self.name);
        let mut sealed: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().map(|ext| ext == "log").unwrap_or(false)
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(&marker))
                        .unwrap_or(false)
            })
            .collect();

        if sealed.len() <= self.keep_sealed {
            return;
        }
        sealed.sort();
        for stale in &sealed[..sealed.len() - self.keep_sealed] {
            let _ = fs::remove_file(stale);
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .shared
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
        state.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self
            .shared
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink lock poisoned"))?;
        state.file.flush()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
