//! Syslog.

use log::Level;
use std::ffi::{CStr, CString};

/// Forwards log records to the system log.
pub struct Syslog(());

impl Syslog {
    /// Opens the system log with the program identifier `ident`.
    ///
    /// The identifier is kept by the C library, hence it must be static.
    pub fn new(ident: &'static CStr) -> Self {
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_CONS | libc::LOG_PID, libc::LOG_DAEMON) };
        Self(())
    }
}

impl log::Log for Syslog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let priority = match record.level() {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        let Ok(msg) = CString::new(record.args().to_string()) else { return };
        unsafe { libc::syslog(priority | libc::LOG_DAEMON, c"%s".as_ptr(), msg.as_ptr()) }
    }

    fn flush(&self) {}
}

impl Drop for Syslog {
    fn drop(&mut self) {
        unsafe { libc::closelog() };
    }
}
