//! Structured logging facade.
//!
//! The core never writes to a UART or VGA framebuffer directly — that is a
//! driver's job — but it still needs a logging discipline for init messages,
//! recoverable-failure diagnostics, and panics. [`Logger`] is a small
//! severity-tagged ring buffer any collaborator can drain and forward to
//! whatever backend it owns (serial, VGA, a host-side test harness), reached
//! through a `try_get_logger()` optional singleton every subsystem shares.

pub mod logger;

pub use logger::{init as init_logger, try_get_logger, LogLevel, Logger};

/// Log at `Info` severity if a logger is installed; otherwise a silent no-op.
pub fn log_info(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log(LogLevel::Info, msg);
    }
}

/// Log at `Warn` severity if a logger is installed; otherwise a silent no-op.
pub fn log_warn(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log(LogLevel::Warn, msg);
    }
}

/// Log at `Error` severity if a logger is installed; otherwise a silent no-op.
pub fn log_err(msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log(LogLevel::Error, msg);
    }
}

/// Log a fatal condition ahead of a panic. Always records location, even if
/// no sink has been installed yet (early-boot panics are the common case).
pub fn log_fatal(file: &'static str, line: u32, msg: &str) {
    if let Some(l) = try_get_logger() {
        l.log_located(LogLevel::Fatal, file, line, msg);
    }
}
