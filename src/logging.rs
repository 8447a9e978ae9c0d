// logging.rs - levelled sink abstraction and datagram hex dumps.

use std::fmt::Write as _;

use tracing::{debug, error, info, warn};

/// Severity accepted by a [`LogSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Information,
    Warning,
    Error,
}

/// Write-only text sink consumed by the transport and engines.
///
/// Implementations are expected to be cheap when a level is filtered out;
/// callers check [`LogSink::enabled`] before formatting expensive messages
/// such as hex dumps.
pub trait LogSink: Send + Sync {
    /// Returns `true` when `level` passes the sink's filter.
    fn enabled(&self, level: LogLevel) -> bool;

    /// Emits one message at the given level.
    fn log(&self, level: LogLevel, message: &str);
}

/// Default sink forwarding everything to the `tracing` macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn enabled(&self, _level: LogLevel) -> bool {
        // tracing subscribers apply their own filtering.
        true
    }

    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Information => info!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
    }
}

/// Sink with a minimum-level filter in front of another sink.
pub struct LevelFilter<S> {
    min: LogLevel,
    inner: S,
}

impl<S: LogSink> LevelFilter<S> {
    /// Wraps `inner`, passing through messages at `min` and above.
    pub fn new(min: LogLevel, inner: S) -> Self {
        Self { min, inner }
    }
}

impl<S: LogSink> LogSink for LevelFilter<S> {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min && self.inner.enabled(level)
    }

    fn log(&self, level: LogLevel, message: &str) {
        if level >= self.min {
            self.inner.log(level, message);
        }
    }
}

/// Formats `bytes` as hex rows of 16, with a wider gap between the eighth
/// and ninth columns. Each row is prefixed with its byte offset.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (row, chunk) in bytes.chunks(16).enumerate() {
        if row > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:04x} ", row * 16);
        for (col, byte) in chunk.iter().enumerate() {
            if col == 8 {
                out.push(' ');
            }
            let _ = write!(out, " {byte:02x}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CaptureSink {
        lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl LogSink for CaptureSink {
        fn enabled(&self, _level: LogLevel) -> bool {
            true
        }

        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_owned()));
        }
    }

    #[test]
    fn level_filter_suppresses_below_minimum() {
        let filter = LevelFilter::new(LogLevel::Warning, CaptureSink::default());
        filter.log(LogLevel::Debug, "dropped");
        filter.log(LogLevel::Error, "kept");
        assert!(!filter.enabled(LogLevel::Information));
        assert!(filter.enabled(LogLevel::Error));

        let lines = filter.inner.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (LogLevel::Error, "kept".to_owned()));
    }

    #[test]
    fn hex_dump_separates_the_two_column_groups() {
        let bytes: Vec<u8> = (0u8..20).collect();
        let dump = hex_dump(&bytes);
        let mut rows = dump.lines();
        assert_eq!(
            rows.next().unwrap(),
            "0000  00 01 02 03 04 05 06 07  08 09 0a 0b 0c 0d 0e 0f"
        );
        assert_eq!(rows.next().unwrap(), "0010  10 11 12 13");
        assert!(rows.next().is_none());
    }

    #[test]
    fn hex_dump_of_empty_buffer_is_empty() {
        assert_eq!(hex_dump(&[]), "");
    }
}
