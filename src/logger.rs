use std::io::{self, Write};

use chrono::Local;
use log::{LevelFilter, Metadata, Record, SetLoggerError};

pub struct Log {
    level: LevelFilter,
}

impl Log {
    pub fn new(level: LevelFilter) -> Self {
        Log { level: level }
    }

    fn emit(&self, level: &str, target: &str, msg: &std::fmt::Arguments) {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        // logging must never take the player down with it:
        let _ = writeln!(out, "{:5} [{}] {}: {}", level, Local::now(), target, msg);
    }
}

impl log::Log for Log {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.emit(record.level().as_str(), record.target(), record.args());
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Installs the process-wide logger. Fails if a logger is already set.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Log::new(level)))?;
    log::set_max_level(level);
    Ok(())
}
