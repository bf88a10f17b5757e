//! rt-audit: turns a shell's output stream into audit records.
//!
//! This crate knows nothing about ptys. It reconstructs lines from raw
//! output bytes and hands finished lines to an audit sink (normally the
//! system log).
//!
//! # Architecture
//!
//! - [`LineAccumulator`] — Buffers printable output bytes and yields a
//!   [`LineRecord`] at every newline.
//! - [`AuditSink`] — Where records go. [`SyslogSink`] writes to syslog,
//!   [`MemorySink`] keeps them in memory.
//! - [`session_ident`] — Builds the syslog identifier from the login name.

pub mod identity;
pub mod line;
pub mod sink;

pub use identity::{login_name, session_ident, IdentityError, DEFAULT_IDENT_PREFIX};
pub use line::{LineAccumulator, LineRecord, GROWTH_INCREMENT, INITIAL_CAPACITY};
pub use sink::{AuditSink, Facility, MemorySink, SinkError, SyslogSink, SESSION_BEGIN_MARKER};
