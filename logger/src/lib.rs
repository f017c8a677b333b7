use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn clock() -> (u64, u64, u64) {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    ((unix / 3600) % 24, (unix / 60) % 60, unix % 60)
}

fn log(level: LogLevel, args: fmt::Arguments) {
    let (hours, minutes, seconds) = clock();
    println!(
        "[{:02}:{:02}:{:02}] [{}] {}",
        hours, minutes, seconds, level, args
    );
}

pub fn debug(fmt: impl fmt::Display) {
    log(LogLevel::Debug, format_args!("{}", fmt));
}

pub fn info(fmt: impl fmt::Display) {
    log(LogLevel::Info, format_args!("{}", fmt));
}

pub fn warn(fmt: impl fmt::Display) {
    log(LogLevel::Warn, format_args!("{}", fmt));
}

pub fn error(fmt: impl fmt::Display) {
    log(LogLevel::Error, format_args!("{}", fmt));
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::debug(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::error(format_args!($($arg)*))
    };
}
