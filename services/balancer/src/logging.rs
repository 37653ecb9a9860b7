//! Logging initialization.
//!
//! Console logs go to stderr in the configured format. When a log
//! directory is configured, JSON logs are also written to a size-capped
//! file there. File write failures are reported on stderr and never stop
//! the process.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggerConfig};

/// Name of the log file inside the log directory.
pub const LOG_FILE_NAME: &str = "vbalancer.log";

/// Log file writer that rotates to a single `.1` backup at max size.
struct LogFileWriter {
    path: PathBuf,
    file: File,
    bytes_written: u64,
    /// `0` disables the cap.
    max_bytes: u64,
}

impl LogFileWriter {
    fn open(path: &Path, max_bytes: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let bytes_written = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            bytes_written,
            max_bytes,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let mut backup = self.path.clone().into_os_string();
        backup.push(".1");
        fs::rename(&self.path, &backup)?;

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.bytes_written = 0;
        Ok(())
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<()> {
        let over_cap = self.bytes_written + buf.len() as u64 > self.max_bytes;
        if self.max_bytes > 0 && self.bytes_written > 0 && over_cap {
            self.rotate()?;
        }

        self.file.write_all(buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Err(e) = self.write_record(buf) {
            // Keep the record; losing the file must not lose the log.
            let mut stderr = io::stderr().lock();
            let _ = writeln!(stderr, "failed to write log file {}: {e}", self.path.display());
            let _ = stderr.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Thread-safe writer wrapper.
struct SharedWriter(Mutex<LogFileWriter>);

impl Write for &SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &'static SharedWriter {
    type Writer = &'static SharedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Initialize the global subscriber.
///
/// The filter prefers `RUST_LOG`, then `level_override`, then the
/// configured level.
pub fn init(config: &LoggerConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(&config.level);
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level '{level}'"))?,
    };

    let console_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().with_writer(io::stderr).boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .boxed(),
    };

    let file_layer = match &config.dir_log {
        Some(dir) => {
            let path = dir.join(LOG_FILE_NAME);
            let writer = LogFileWriter::open(&path, config.file_size_mb.saturating_mul(1024 * 1024))
                .with_context(|| format!("failed to open log file {}", path.display()))?;

            // Lives for the whole process.
            let shared: &'static SharedWriter =
                Box::leak(Box::new(SharedWriter(Mutex::new(writer))));

            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(shared)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}
