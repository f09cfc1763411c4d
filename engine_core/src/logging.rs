use std::fmt;
use std::sync::{Mutex, OnceLock};

use crate::observability::lock_unpoisoned;

pub const LOG_TARGET: &str = "engine_core";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        write!(f, "{}", label)
    }
}

type Logger = Box<dyn Fn(LogLevel, &str) + Send + Sync + 'static>;

// None routes through the `log` facade.
fn logger_cell() -> &'static Mutex<Option<Logger>> {
    static LOGGER: OnceLock<Mutex<Option<Logger>>> = OnceLock::new();
    LOGGER.get_or_init(|| Mutex::new(None))
}

/// Replaces the `log` facade with a custom sink, e.g. an in-game console.
pub fn set_logger(logger: impl Fn(LogLevel, &str) + Send + Sync + 'static) {
    let mut guard = lock_unpoisoned(logger_cell());
    *guard = Some(Box::new(logger));
}

pub fn reset_logger() {
    let mut guard = lock_unpoisoned(logger_cell());
    *guard = None;
}

pub fn log(level: LogLevel, message: impl AsRef<str>) {
    let guard = lock_unpoisoned(logger_cell());
    match guard.as_ref() {
        Some(logger) => logger(level, message.as_ref()),
        None => log::log!(target: LOG_TARGET, level.to_log(), "{}", message.as_ref()),
    }
}

pub fn error(message: impl AsRef<str>) {
    log(LogLevel::Error, message);
}

pub fn warn(message: impl AsRef<str>) {
    log(LogLevel::Warn, message);
}

pub fn info(message: impl AsRef<str>) {
    log(LogLevel::Info, message);
}

pub fn debug(message: impl AsRef<str>) {
    log(LogLevel::Debug, message);
}
