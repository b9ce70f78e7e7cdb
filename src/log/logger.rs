//! Ring-buffer backed logger.
//!
//! A fixed number of [`Record`]s are kept in memory; once full, the oldest
//! record is overwritten. A collaborator (serial driver, test harness) drains
//! the buffer at its own pace by calling [`Logger::drain`]. No formatting or
//! I/O happens inside the core — `msg` is a `&'static str` or a pre-rendered
//! line, never a `format!` call, since the core has no heap dependency this
//! early in boot (the logger is installed before [`crate::memory::heap`]).

use spin::{Mutex, Once};

const RING_CAPACITY: usize = 256;
const MSG_CAPACITY: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Clone, Copy)]
pub struct Record {
    pub level: LogLevel,
    pub file: Option<&'static str>,
    pub line: u32,
    len: usize,
    buf: [u8; MSG_CAPACITY],
}

impl Record {
    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8 log message>")
    }
}

struct Ring {
    slots: [Option<Record>; RING_CAPACITY],
    head: usize,
    dropped: u64,
}

impl Ring {
    const fn new() -> Self {
        Ring { slots: [None; RING_CAPACITY], head: 0, dropped: 0 }
    }

    fn push(&mut self, rec: Record) {
        if self.slots[self.head].is_some() {
            self.dropped += 1;
        }
        self.slots[self.head] = Some(rec);
        self.head = (self.head + 1) % RING_CAPACITY;
    }
}

pub struct Logger {
    ring: Mutex<Ring>,
}

impl Logger {
    const fn new() -> Self {
        Logger { ring: Mutex::new(Ring::new()) }
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        self.log_located(level, "", 0, msg);
    }

    pub fn log_located(&self, level: LogLevel, file: &'static str, line: u32, msg: &str) {
        let mut buf = [0u8; MSG_CAPACITY];
        let bytes = msg.as_bytes();
        let len = bytes.len().min(MSG_CAPACITY);
        buf[..len].copy_from_slice(&bytes[..len]);
        let file = if file.is_empty() { None } else { Some(file) };
        self.ring.lock().push(Record { level, file, line, len, buf });
    }

    /// Copies up to `out.len()` records, oldest first, returning the count
    /// written. Intended for a collaborator's periodic drain loop.
    pub fn drain(&self, out: &mut [Record]) -> usize {
        let ring = self.ring.lock();
        let mut n = 0;
        for i in 0..RING_CAPACITY {
            let idx = (ring.head + i) % RING_CAPACITY;
            if let Some(rec) = ring.slots[idx] {
                if n >= out.len() {
                    break;
                }
                out[n] = rec;
                n += 1;
            }
        }
        n
    }

    pub fn dropped_count(&self) -> u64 {
        self.ring.lock().dropped
    }
}

static LOGGER: Once<Logger> = Once::new();

/// Installs the global logger. Idempotent: a second call is a no-op, matching
/// the single-init discipline every other subsystem in the core follows.
pub fn init() {
    LOGGER.call_once(Logger::new);
}

/// Returns the installed logger, or `None` before [`init`] has run. Every
/// call site in the core treats a missing logger as "nothing to do" rather
/// than an error — logging must never be load-bearing for correctness.
pub fn try_get_logger() -> Option<&'static Logger> {
    LOGGER.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_records_oldest_first() {
        let logger = Logger::new();
        logger.log(LogLevel::Info, "first");
        logger.log(LogLevel::Warn, "second");
        logger.log(LogLevel::Error, "third");

        let mut out = [Record { level: LogLevel::Info, file: None, line: 0, len: 0, buf: [0; MSG_CAPACITY] }; 8];
        let n = logger.drain(&mut out);
        assert_eq!(n, 3);
        assert_eq!(out[0].message(), "first");
        assert_eq!(out[1].message(), "second");
        assert_eq!(out[2].message(), "third");
    }

    #[test]
    fn ring_wraps_and_counts_dropped_records() {
        let logger = Logger::new();
        for i in 0..RING_CAPACITY + 5 {
            let _ = i;
            logger.log(LogLevel::Info, "x");
        }
        assert_eq!(logger.dropped_count(), 5);
    }

    #[test]
    fn message_longer_than_capacity_is_truncated_not_panicking() {
        let logger = Logger::new();
        let long = "a".repeat(MSG_CAPACITY * 2);
        logger.log(LogLevel::Info, &long);
        let mut out = [Record { level: LogLevel::Info, file: None, line: 0, len: 0, buf: [0; MSG_CAPACITY] }; 1];
        logger.drain(&mut out);
        assert_eq!(out[0].message().len(), MSG_CAPACITY);
    }

    #[test]
    fn log_located_records_file_and_line() {
        let logger = Logger::new();
        logger.log_located(LogLevel::Fatal, "pfa.rs", 42, "bitmap inconsistent");
        let mut out = [Record { level: LogLevel::Info, file: None, line: 0, len: 0, buf: [0; MSG_CAPACITY] }; 1];
        logger.drain(&mut out);
        assert_eq!(out[0].file, Some("pfa.rs"));
        assert_eq!(out[0].line, 42);
        assert_eq!(out[0].level, LogLevel::Fatal);
    }
}
