//! Kernel logging facility
//!
//! Provides thread-safe logging functionality for the kernel using the `log` crate.
//! Log levels are configured based on build configuration (debug/release).
//! Output is routed through the registered diagnostics [`Sink`].

use crate::diag::{Sink, SinkWriter};
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    sink: Mutex<Option<&'static mut (dyn Sink + Send)>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new logger instance with no sink attached
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }
}

impl Log for Logger {
    /// Determines if a log message should be processed based on its level
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message" and hands them to the sink.
    /// Messages logged before a sink is registered are dropped.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut guard = self.sink.lock();
            if let Some(sink) = guard.as_mut() {
                let mut writer = SinkWriter::new(&mut **sink);
                let _ = writeln!(writer, "[{}] {}", record.level(), record.args());
            }
        }
    }

    /// Flush buffered logs (no-op in this implementation)
    fn flush(&self) {}
}

/// Initializes the logging system
///
/// # Arguments
/// * `sink` - destination for all log output
///
/// # Notes
/// * Sets different log levels for debug/release builds:
///   - Debug builds: LevelFilter::Debug
///   - Release builds: LevelFilter::Info
pub fn init(sink: &'static mut (dyn Sink + Send)) {
    *LOGGER.sink.lock() = Some(sink);
    log::set_logger(&LOGGER)
        .map(|()| {
            log::set_max_level(if cfg!(debug_assertions) {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            })
        })
        .expect("Logger initialization failed");
}
