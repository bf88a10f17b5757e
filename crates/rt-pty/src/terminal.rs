//! Terminal mode handling for the controlling terminal.
//!
//! The original mode is captured as an explicit value and handed to a
//! guard; the guard puts it back when the session ends, on every path that
//! unwinds.

use std::os::fd::{AsFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("failed to duplicate terminal descriptor: {0}")]
    Dup(#[source] std::io::Error),

    #[error("tcgetattr failed: {0}")]
    Capture(#[source] Errno),

    #[error("tcsetattr failed: {0}")]
    Apply(#[source] Errno),
}

impl TerminalError {
    /// True when the descriptor is not a terminal at all.
    pub fn is_not_a_tty(&self) -> bool {
        matches!(self, TerminalError::Capture(Errno::ENOTTY))
    }
}

/// A terminal's mode as captured before we touched it.
pub struct TerminalMode {
    fd: OwnedFd,
    original: Termios,
}

impl TerminalMode {
    /// Capture the current mode of the terminal behind `fd`.
    ///
    /// The descriptor is duplicated so the captured mode can be restored
    /// independently of whoever owns `fd`.
    pub fn capture<Fd: AsFd>(fd: Fd) -> Result<Self, TerminalError> {
        let fd = fd.as_fd().try_clone_to_owned().map_err(TerminalError::Dup)?;
        let original = tcgetattr(&fd).map_err(TerminalError::Capture)?;
        Ok(Self { fd, original })
    }

    /// The captured (original) settings.
    pub fn original(&self) -> &Termios {
        &self.original
    }

    /// Settings for the relay: no local echo, no line buffering.
    ///
    /// ISIG stays on so the interrupt character still raises SIGINT for the
    /// foreground process group, which includes the shell.
    pub fn raw(&self) -> Termios {
        let mut raw = self.original.clone();
        raw.local_flags.remove(LocalFlags::ECHO | LocalFlags::ICANON);
        raw
    }

    /// Put the captured settings back.
    pub fn restore(&self) -> Result<(), TerminalError> {
        tcsetattr(&self.fd, SetArg::TCSAFLUSH, &self.original).map_err(TerminalError::Apply)
    }
}

/// Keeps a terminal in raw mode until restored or dropped.
pub struct RawModeGuard {
    mode: TerminalMode,
    restored: bool,
}

impl RawModeGuard {
    /// Switch the terminal captured in `mode` to raw mode.
    pub fn engage(mode: TerminalMode) -> Result<Self, TerminalError> {
        tcsetattr(&mode.fd, SetArg::TCSAFLUSH, &mode.raw()).map_err(TerminalError::Apply)?;
        log::debug!("terminal switched to raw mode");
        Ok(Self {
            mode,
            restored: false,
        })
    }

    /// Restore the original mode now, reporting failure.
    pub fn restore(mut self) -> Result<(), TerminalError> {
        self.restored = true;
        self.mode.restore()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if !self.restored {
            // Nothing else to do if this fails; the shell resets the
            // terminal on the next prompt anyway.
            if let Err(e) = self.mode.restore() {
                log::warn!("failed to restore terminal mode: {e}");
            }
        }
    }
}
