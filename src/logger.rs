use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use conquer_once::OnceCell;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::oracle::ContextId;

/// Durable log, opened once by the parent and inherited by every actor.
static LOG_FILE: OnceCell<File> = OnceCell::uninit();

static LOGGER: HarnessLogger = HarnessLogger::new();

/// Everything up to this level reaches the file, whatever the console shows.
const FILE_LEVEL: LevelFilter = LevelFilter::Debug;

/// Writes each record to the durable log and, within the console level,
/// to stderr. Every line carries the emitting `pid:tid`.
pub struct HarnessLogger {
    console: AtomicUsize,
}

impl HarnessLogger {
    const fn new() -> Self {
        HarnessLogger {
            console: AtomicUsize::new(LevelFilter::Warn as usize),
        }
    }

    fn console_enabled(&self, level: Level) -> bool {
        (level as usize) <= self.console.load(Ordering::Relaxed)
    }
}

fn format_line(context: ContextId, record: &Record) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "[{}.{:06} {} {:>5} {}] {}\n",
        now.as_secs(),
        now.subsec_micros(),
        context,
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for HarnessLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= FILE_LEVEL || self.console_enabled(metadata.level())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Formatted once and written with a single call, so lines from
        // concurrent actors interleave whole.
        let line = format_line(ContextId::current(), record);

        if record.level() <= FILE_LEVEL {
            if let Some(mut file) = LOG_FILE.get() {
                let _ = file.write_all(line.as_bytes());
            }
        }
        if self.console_enabled(record.level()) {
            let _ = io::stderr().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Some(mut file) = LOG_FILE.get() {
            let _ = file.flush();
        }
    }
}

/// Whether a record at `level` already reaches stderr through the logger.
/// False until [`init`] has run.
pub fn reaches_console(level: Level) -> bool {
    LOG_FILE.is_initialized() && LOGGER.console_enabled(level)
}

/// Install the logger. The durable log is appended to, never truncated.
pub fn init(log_file: &Path, console: LevelFilter) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(log_file)?;
    LOG_FILE
        .try_init_once(|| file)
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "log file already installed"))?;

    LOGGER.console.store(console as usize, Ordering::Relaxed);
    log::set_logger(&LOGGER)
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;
    log::set_max_level(console.max(FILE_LEVEL));
    Ok(())
}
