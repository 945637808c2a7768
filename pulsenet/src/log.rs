//! Typed logging policy for a [`Context`](crate::context::Context).
//!
//! The wire-format and state-machine code never formats a log message directly; it checks
//! [`LogSink::enabled`] against the Context's atomic level first, then hands a `slog` structured
//! record (level plus key-value fields) to the sink. Disabled levels cost one relaxed atomic load.

use slog::{Drain, Logger};
use std::sync::atomic::{AtomicU8, Ordering};

/// Logging verbosity, ordered least to most chatty. Matches the six levels of the original
/// protocol: silent, error, warning, info, verbose, debug.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum LogLevel {
    Silent = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Verbose = 4,
    Debug = 5,
}

impl LogLevel {
    #[inline]
    fn from_u8(value: u8) -> LogLevel {
        match value {
            0 => LogLevel::Silent,
            1 => LogLevel::Error,
            2 => LogLevel::Warning,
            3 => LogLevel::Info,
            4 => LogLevel::Verbose,
            _ => LogLevel::Debug,
        }
    }

    /// Default level: chatty in debug builds, terse in release, matching the reference
    /// implementation's `#ifdef NDEBUG` split.
    #[inline]
    pub fn default_for_build() -> LogLevel {
        if cfg!(debug_assertions) {
            LogLevel::Debug
        } else {
            LogLevel::Warning
        }
    }
}

/// Lock-free current logging level, readable/writable from any thread without the Context mutex.
pub struct AtomicLogLevel(AtomicU8);

impl AtomicLogLevel {
    #[inline]
    pub fn new(level: LogLevel) -> AtomicLogLevel {
        AtomicLogLevel(AtomicU8::new(level as u8))
    }

    #[inline]
    pub fn load(&self) -> LogLevel {
        LogLevel::from_u8(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, level: LogLevel) {
        self.0.store(level as u8, Ordering::Relaxed);
    }
}

/// Gate plus sink: wraps a `slog::Logger` with the atomic level check the core consults before
/// ever building a structured record.
pub struct LogSink {
    logger: Logger,
    level: AtomicLogLevel,
}

impl LogSink {
    pub fn new(logger: Logger, level: LogLevel) -> LogSink {
        LogSink {
            logger,
            level: AtomicLogLevel::new(level),
        }
    }

    /// Builds a sink backed by a terminal drain decorated with async buffering, the same stack
    /// `flux::logging` reaches for (`slog-term` + `slog-async`) rather than a bespoke writer.
    pub fn terminal(level: LogLevel) -> LogSink {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        LogSink::new(Logger::root(drain, slog::o!()), level)
    }

    /// A sink that discards everything; used by embedders that want `LogLevel::Silent` semantics
    /// without paying for a drain at all.
    pub fn discard() -> LogSink {
        LogSink::new(Logger::root(slog::Discard, slog::o!()), LogLevel::Silent)
    }

    #[inline]
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    #[inline]
    pub fn level(&self) -> LogLevel {
        self.level.load()
    }

    #[inline]
    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level)
    }

    /// Whether a message at `level` would actually reach the drain.
    #[inline]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Silent && level <= self.level()
    }
}
