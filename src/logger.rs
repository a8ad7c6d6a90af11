use std::env;
use std::io::{stderr, Write};
use std::str::FromStr;

use anyhow::Result;
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

pub const LOG_LEVEL_ENV: &str = "DUCKER_LOG_LEVEL";

static DUCKER_LOGGER: OnceCell<DuckerLogger> = OnceCell::new();

/// Installs the process-wide logger. The level defaults to `info` and can be
/// overridden through `DUCKER_LOG_LEVEL`.
pub fn init() -> Result<()> {
    let level_filter = match env::var(LOG_LEVEL_ENV) {
        Ok(level) => LevelFilter::from_str(&level).unwrap_or(LevelFilter::Info),
        Err(_) => LevelFilter::Info,
    };

    let logger = DUCKER_LOGGER.get_or_init(|| DuckerLogger::new(level_filter.to_level()));
    log::set_logger(logger).map(|()| log::set_max_level(level_filter))?;
    Ok(())
}

pub struct DuckerLogger {
    level: Option<log::Level>,
}

impl DuckerLogger {
    fn new(level: Option<log::Level>) -> Self {
        Self { level }
    }
}

impl Log for DuckerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.level.map_or(false, |level| metadata.level() <= level)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(stderr(), "[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}
