//! Logger backend for the `log` facade
//!
//! Formats each record as `[LEVEL] target: message` into a fixed stack
//! buffer and hands the bytes to a host-provided [`LogSink`]. Long lines are
//! cut at the buffer size.

use log::{Level, LevelFilter, Metadata, Record};
use spin::Once;

use crate::scheduler::core::error::{Result, ScxError};

/// Formatted line size
const LINE_MAX: usize = 512;

/// Where log lines go, e.g. a serial port or a ring buffer
pub trait LogSink: Send + Sync {
    fn write(&self, bytes: &[u8]);
}

struct ScxLogger;

static SINK: Once<&'static dyn LogSink> = Once::new();
static LOGGER: ScxLogger = ScxLogger;

impl log::Log for ScxLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = SINK.get() else {
            return;
        };

        let level_str = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        use core::fmt::Write;
        let mut buf = [0u8; LINE_MAX];
        let pos = {
            let mut writer = BufferWriter { buffer: &mut buf, pos: 0 };
            let _ = core::write!(&mut writer, "[{}] {}: {}\n", level_str, record.target(), record.args());
            writer.pos
        };
        sink.write(&buf[..pos]);
    }

    fn flush(&self) {}
}

/// Buffer writer for formatting without alloc. Drops what doesn't fit.
pub struct BufferWriter<'a> {
    pub buffer: &'a mut [u8],
    pub pos: usize,
}

impl<'a> core::fmt::Write for BufferWriter<'a> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buffer.len() - self.pos;
        let to_write = bytes.len().min(remaining);

        if to_write > 0 {
            self.buffer[self.pos..self.pos + to_write].copy_from_slice(&bytes[..to_write]);
            self.pos += to_write;
        }

        Ok(())
    }
}

/// Install the logger at `Info`
pub fn init(sink: &'static dyn LogSink) -> Result<()> {
    init_with_level(sink, LevelFilter::Info)
}

/// Install the logger with a specific level
pub fn init_with_level(sink: &'static dyn LogSink, level: LevelFilter) -> Result<()> {
    if SINK.is_completed() {
        return Err(ScxError::LoggerAlreadySet);
    }
    SINK.call_once(|| sink);
    log::set_logger(&LOGGER).map_err(|_| ScxError::LoggerAlreadySet)?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::fmt::Write;
    use spin::Mutex;

    struct Capture(Mutex<Vec<String>>);

    impl LogSink for Capture {
        fn write(&self, bytes: &[u8]) {
            self.0.lock().push(String::from_utf8_lossy(bytes).into_owned());
        }
    }

    static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

    #[test]
    fn test_buffer_writer_truncates() {
        let mut buf = [0u8; 8];
        let mut w = BufferWriter { buffer: &mut buf, pos: 0 };
        write!(w, "0123456789").unwrap();
        assert_eq!(w.pos, 8);
        assert_eq!(&buf, b"01234567");
    }

    #[test]
    fn test_init_once_and_format() {
        init_with_level(&CAPTURE, LevelFilter::Debug).unwrap();
        assert_eq!(init(&CAPTURE), Err(ScxError::LoggerAlreadySet));

        log::debug!(target: "scx", "dsq {} created", 5);
        log::trace!(target: "scx", "filtered");
        let lines = CAPTURE.0.lock();
        assert!(lines.iter().any(|l| l == "[DEBUG] scx: dsq 5 created\n"));
        assert!(!lines.iter().any(|l| l.contains("filtered")));
    }
}
