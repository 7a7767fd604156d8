#![cfg_attr(not(feature = "log"), allow(unused))]

use {
    std::{
        fmt,
        io::{self, Write as _},
        sync::Mutex,
        time::Instant,
    },
};

#[cfg(feature = "log")]
use log::{LevelFilter, Log, Metadata, Record};

/// A `fmt::Write` adapter that prints the time since startup before each line.
pub struct StampedLogger<L: fmt::Write> {
    start: Instant,
    inner: L,
    line_start: bool,
}

impl<L: fmt::Write> StampedLogger<L> {
    pub fn new(inner: L) -> Self {
        Self {
            start: Instant::now(),
            inner,
            line_start: true,
        }
    }
}

impl<L: fmt::Write> fmt::Write for StampedLogger<L> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for (i, line) in s.split('\n').enumerate() {
            if i != 0 {
                self.inner.write_char('\n')?;
                self.line_start = true;
            }
            if line.is_empty() {
                continue;
            }
            if self.line_start {
                let elapsed = self.start.elapsed();
                write!(self.inner, "{}.{:06} - ", elapsed.as_secs(), elapsed.subsec_micros())?;
                self.line_start = false;
            }
            self.inner.write_str(line)?;
        }

        Ok(())
    }
}

/// A `fmt::Write` sink for stdout.
pub struct StdoutLogger;

impl fmt::Write for StdoutLogger {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        io::stdout().write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// Wraps a `fmt::Write` implementor and forwards the `log` crate's logging macros to it.
pub struct WriteLogger<W: fmt::Write + Send> {
    writer: Mutex<W>,
}

impl<W: fmt::Write + Send> WriteLogger<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[cfg(feature = "log")]
impl<W: fmt::Write + Send> Log for WriteLogger<W> {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            let mut writer = match self.writer.lock() {
                Ok(writer) => writer,
                Err(poisoned) => poisoned.into_inner(),
            };
            let _ = writeln!(writer, "{} - {}", record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

type Logger = StampedLogger<StdoutLogger>;

#[cfg(feature = "log")]
pub fn init() {
    let logger: &'static WriteLogger<Logger> =
        Box::leak(Box::new(WriteLogger::new(StampedLogger::new(StdoutLogger))));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(LevelFilter::max());
    }

    log::info!("Logger ready");
}

#[cfg(not(feature = "log"))]
pub fn init() {}
