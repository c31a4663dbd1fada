//! Console logger for tests and demo binaries.
//!
//! The library itself only uses the `log` facade; installing a sink is the
//! embedder's business.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct Logger;

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color_code = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 33, // BrightBlack
        };
        println!(
            "\u{1B}[{}m[{:>5}] {} \u{1B}[0m",
            color_code,
            record.level(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

/// Installs the console logger. Level comes from the `LOG` env var.
/// Safe to call more than once; later calls keep the first sink.
pub fn init_logger() {
    static LOGGER: Logger = Logger;
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(match std::env::var("LOG").as_deref() {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    });
}
