//! A [`log::Log`] implementation writing one line per record to stdout.
//!
//! Lines look like
//! `00:00:01.000123 [4242:worker] [DEBUG] [mod.rs:310] [libos_handles::host::descriptor::socket] Bound socket`,
//! with the elapsed wall time since the logger was created and the thread id and name. Error
//! records can also be mirrored to stderr.

use std::io::Write;
use std::time::{Duration, Instant};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

use crate::core::configuration::ConfigOptions;

static LOGGER: Lazy<Logger> = Lazy::new(Logger::new);

thread_local!(static THREAD_ID: nix::unistd::Pid = nix::unistd::gettid());

/// Install the logger. Fails if a logger is already installed.
pub fn init(max_log_level: LevelFilter, log_errors_to_stderr: bool) -> Result<(), SetLoggerError> {
    // the first call decides; later calls fail in `set_logger` below
    let _ = LOGGER.max_level.set(max_log_level);
    let _ = LOGGER.log_errors_to_stderr.set(log_errors_to_stderr);

    log::set_logger(&*LOGGER)?;
    log::set_max_level(max_log_level);
    Ok(())
}

/// Install the logger with the level and stderr mirroring from `config.general`.
pub fn init_from_config(config: &ConfigOptions) -> Result<(), SetLoggerError> {
    init(
        config.general.log_level.into(),
        config.general.log_errors_to_stderr,
    )
}

struct Logger {
    start: Instant,
    max_level: OnceCell<LevelFilter>,
    log_errors_to_stderr: OnceCell<bool>,
}

impl Logger {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            max_level: OnceCell::new(),
            log_errors_to_stderr: OnceCell::new(),
        }
    }

    fn max_level(&self) -> LevelFilter {
        self.max_level.get().copied().unwrap_or(LevelFilter::Trace)
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = LogLine {
            wall_time: self.start.elapsed(),
            thread_id: THREAD_ID
                .try_with(|id| *id)
                .unwrap_or_else(|_| nix::unistd::gettid()),
            thread_name: std::thread::current().name().map(str::to_owned),
            level: record.level(),
            file: record.file(),
            line: record.line(),
            module_path: record.module_path(),
            message: record.args(),
        }
        .to_string();

        // there's nowhere to report a failed write
        let _ = std::io::stdout().lock().write_all(line.as_bytes());
        if record.level() == Level::Error && *self.log_errors_to_stderr.get().unwrap_or(&false) {
            let _ = std::io::stderr().lock().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }
}

struct LogLine<'a> {
    wall_time: Duration,
    thread_id: nix::unistd::Pid,
    thread_name: Option<String>,
    level: Level,
    file: Option<&'a str>,
    line: Option<u32>,
    module_path: Option<&'a str>,
    message: &'a dyn std::fmt::Display,
}

impl std::fmt::Display for LogLine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.wall_time.as_secs();
        write!(
            f,
            "{:02}:{:02}:{:02}.{:06}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.wall_time.subsec_micros()
        )?;
        write!(
            f,
            " [{}:{}]",
            self.thread_id,
            self.thread_name.as_deref().unwrap_or("")
        )?;
        write!(f, " [{level}]", level = self.level)?;
        write!(
            f,
            " [{file}:",
            file = self
                .file
                .map(|f| if let Some(sep_pos) = f.rfind('/') {
                    &f[(sep_pos + 1)..]
                } else {
                    f
                })
                .unwrap_or("n/a"),
        )?;
        if let Some(line) = self.line {
            write!(f, "{line}")?;
        } else {
            write!(f, "n/a")?;
        }
        writeln!(
            f,
            "] [{module}] {msg}",
            module = self.module_path.unwrap_or("n/a"),
            msg = self.message
        )
    }
}
