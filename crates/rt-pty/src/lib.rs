//! rt-pty: pty allocation, the shell process, and the relay loop.
//!
//! This crate sits between the user's terminal and a shell running on a
//! pseudo-terminal. It copies keystrokes to the shell, copies the shell's
//! output back to the terminal, and feeds that output through
//! `rt_audit::LineAccumulator` into an audit sink.
//!
//! # Architecture
//!
//! - [`PtySession`] — Allocates the pty pair (open, grant, unlock).
//! - [`ChildProcess`] — Forks the shell onto the pty slave and reaps it.
//! - [`TerminalMode`] / [`RawModeGuard`] — Captures the terminal's mode and
//!   keeps it raw for the session.
//! - [`RelayLoop`] — The single-threaded poll loop that runs the session.

pub mod child;
pub mod pty;
pub mod relay;
pub mod terminal;

pub use child::{launch, ChildError, ChildExit, ChildProcess, LaunchError};
pub use pty::{allocate, PtyError, PtySession};
pub use relay::{
    ignore_interrupts, Readiness, RelayError, RelayLoop, RelayOutcome, RelayState, RelayStats,
    DEFAULT_EXIT_CHECK_INTERVAL, READ_CHUNK,
};
pub use terminal::{RawModeGuard, TerminalError, TerminalMode};
