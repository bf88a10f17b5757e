//! Audit sinks: where completed lines end up.
//!
//! The production sink is the system log, opened once per session with an
//! identifier naming the user. [`MemorySink`] collects records in memory
//! for tests and for embedding the relay elsewhere.

use std::ffi::CString;
use std::fmt;
use std::str::FromStr;

use nix::libc;

/// First record written to a freshly opened session log.
pub const SESSION_BEGIN_MARKER: &str = "rt session beginning";

/// Errors from opening or configuring a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("syslog identifier contains a NUL byte")]
    InvalidIdent,

    #[error("unknown syslog facility: {0}")]
    UnknownFacility(String),
}

/// Consumer of completed audit records.
pub trait AuditSink {
    /// Append one record.
    fn append(&mut self, record: &str);

    /// Close the log stream. Appends after `close` are dropped.
    fn close(&mut self) {}
}

impl<S: AuditSink + ?Sized> AuditSink for Box<S> {
    fn append(&mut self, record: &str) {
        (**self).append(record)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<S: AuditSink + ?Sized> AuditSink for &mut S {
    fn append(&mut self, record: &str) {
        (**self).append(record)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Syslog facility a session is logged under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facility {
    #[default]
    Auth,
    AuthPriv,
    User,
    Daemon,
    Local0,
    Local1,
    Local2,
    Local3,
    Local4,
    Local5,
    Local6,
    Local7,
}

impl Facility {
    fn as_raw(self) -> libc::c_int {
        match self {
            Facility::Auth => libc::LOG_AUTH,
            Facility::AuthPriv => libc::LOG_AUTHPRIV,
            Facility::User => libc::LOG_USER,
            Facility::Daemon => libc::LOG_DAEMON,
            Facility::Local0 => libc::LOG_LOCAL0,
            Facility::Local1 => libc::LOG_LOCAL1,
            Facility::Local2 => libc::LOG_LOCAL2,
            Facility::Local3 => libc::LOG_LOCAL3,
            Facility::Local4 => libc::LOG_LOCAL4,
            Facility::Local5 => libc::LOG_LOCAL5,
            Facility::Local6 => libc::LOG_LOCAL6,
            Facility::Local7 => libc::LOG_LOCAL7,
        }
    }
}

impl FromStr for Facility {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let facility = match s.to_ascii_lowercase().as_str() {
            "auth" => Facility::Auth,
            "authpriv" => Facility::AuthPriv,
            "user" => Facility::User,
            "daemon" => Facility::Daemon,
            "local0" => Facility::Local0,
            "local1" => Facility::Local1,
            "local2" => Facility::Local2,
            "local3" => Facility::Local3,
            "local4" => Facility::Local4,
            "local5" => Facility::Local5,
            "local6" => Facility::Local6,
            "local7" => Facility::Local7,
            _ => return Err(SinkError::UnknownFacility(s.to_string())),
        };
        Ok(facility)
    }
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facility::Auth => f.write_str("auth"),
            Facility::AuthPriv => f.write_str("authpriv"),
            Facility::User => f.write_str("user"),
            Facility::Daemon => f.write_str("daemon"),
            Facility::Local0 => f.write_str("local0"),
            Facility::Local1 => f.write_str("local1"),
            Facility::Local2 => f.write_str("local2"),
            Facility::Local3 => f.write_str("local3"),
            Facility::Local4 => f.write_str("local4"),
            Facility::Local5 => f.write_str("local5"),
            Facility::Local6 => f.write_str("local6"),
            Facility::Local7 => f.write_str("local7"),
        }
    }
}

/// Audit sink backed by `syslog(3)`.
///
/// `openlog` state is process-wide, so only one `SyslogSink` should be open
/// at a time. The identifier is kept alive here because `openlog` stores the
/// pointer rather than copying the string.
pub struct SyslogSink {
    ident: CString,
    open: bool,
}

impl SyslogSink {
    /// Open the system log under `ident`, tagging records with our pid.
    pub fn open(ident: &str, facility: Facility) -> Result<Self, SinkError> {
        let ident = CString::new(ident).map_err(|_| SinkError::InvalidIdent)?;

        // SAFETY: `ident` is owned by the returned sink and outlives every
        // syslog call made through it; `closelog` runs before it is freed.
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID, facility.as_raw()) };
        log::debug!("syslog opened as {:?} ({facility})", ident);

        Ok(Self { ident, open: true })
    }

    /// The identifier records are logged under.
    pub fn ident(&self) -> &str {
        self.ident.to_str().unwrap_or_default()
    }
}

impl AuditSink for SyslogSink {
    fn append(&mut self, record: &str) {
        if !self.open {
            return;
        }
        let Ok(message) = CString::new(record) else {
            log::warn!("dropping audit record with embedded NUL");
            return;
        };

        // SAFETY: constant "%s" format with a single NUL-terminated argument.
        unsafe {
            libc::syslog(libc::LOG_INFO, c"%s".as_ptr(), message.as_ptr());
        }
    }

    fn close(&mut self) {
        if self.open {
            // SAFETY: closes the connection opened in `open`.
            unsafe { libc::closelog() };
            self.open = false;
        }
    }
}

impl Drop for SyslogSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory sink that keeps every record.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<String>,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records appended so far, oldest first.
    pub fn records(&self) -> &[String] {
        &self.records
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn into_records(self) -> Vec<String> {
        self.records
    }
}

impl AuditSink for MemorySink {
    fn append(&mut self, record: &str) {
        if !self.closed {
            self.records.push(record.to_string());
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
