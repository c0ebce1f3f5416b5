//! `log` backend that forwards formatted records to a board-supplied sink.
//!
//! The driver itself only uses the `log` macros; a board calls
//! `init_logger` once at boot with its UART writer.

use alloc::boxed::Box;
use alloc::format;

/// Writes one formatted line per record to `sink`.
pub struct SinkLogger {
    sink: fn(&str),
    level: log::LevelFilter,
}

impl SinkLogger {
    pub const fn new(sink: fn(&str), level: log::LevelFilter) -> Self {
        Self { sink, level }
    }
}

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            (self.sink)(&format!("[{}] {}: {}", record.level(), record.target(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Install a `SinkLogger` as the global logger (call once at boot).
///
/// A second call leaves the first logger in place and only changes the
/// max level.
pub fn init_logger(sink: fn(&str), level: log::LevelFilter) {
    let logger: &'static SinkLogger = Box::leak(Box::new(SinkLogger::new(sink, level)));
    if log::set_logger(logger).is_err() {
        log::warn!("logger already installed");
    }
    log::set_max_level(level);
}
