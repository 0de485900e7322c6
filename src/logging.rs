//! Tracing setup.
//!
//! The CLI logs to a rotating file in the data directory unless verbose
//! output is requested. The echo server always logs to stderr, since its
//! stdout carries protocol frames.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "mcop=info,warn";

/// Rotated log files kept besides the current one.
const KEEP_LOGS: u32 = 3;

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Append to `<dir>/mcop.log`, rotating older logs.
    File(PathBuf),
    Stderr,
}

/// Install the global subscriber. Returns the log file path, if any.
///
/// Falls back to stderr when the log file cannot be opened. Calling this
/// twice is harmless; the second subscriber is ignored.
pub fn init_tracing(target: LogTarget) -> Option<PathBuf> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let log_path = match target {
        LogTarget::File(dir) => match open_log_file(&dir) {
            Ok((path, file)) => {
                let _ = fmt::fmt()
                    .with_env_filter(filter)
                    .with_writer(FlushingWriter::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(false)
                    .try_init();
                Some(path)
            }
            Err(e) => {
                eprintln!("mcop: cannot open log file in {}: {e}", dir.display());
                init_stderr(filter);
                None
            }
        },
        LogTarget::Stderr => {
            init_stderr(filter);
            None
        }
    };

    // Startup banner, to find the right log file quickly
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcop starting ==="
    );
    log_path
}

fn init_stderr(filter: EnvFilter) {
    let _ = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn open_log_file(dir: &Path) -> std::io::Result<(PathBuf, File)> {
    std::fs::create_dir_all(dir)?;
    let log_path = dir.join("mcop.log");
    rotate_log_file(&log_path, KEEP_LOGS);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    Ok((log_path, file))
}

/// Shift `mcop.log` → `.1` → `.2` …, dropping anything past `keep`.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |i: u32| format!("{}.{i}", base_path.display());

    let _ = std::fs::remove_file(numbered(keep));
    for i in (1..keep).rev() {
        let _ = std::fs::rename(numbered(i), numbered(i + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// File writer that flushes after every event, so the log survives a kill.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
