use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};

/// Errors from allocating a pseudo-terminal.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("error opening pty: {0}")]
    Open(#[source] Errno),

    #[error("ptsname failed: {0}")]
    SlaveName(#[source] Errno),

    #[error("grantpt failed: {0}")]
    Grant(#[source] Errno),

    #[error("unlockpt failed: {0}")]
    Unlock(#[source] Errno),

    #[error("failed to set close-on-exec on pty master: {0}")]
    CloseOnExec(#[source] Errno),
}

/// An allocated pty pair: the master end we own and the slave device path
/// the child will open.
pub struct PtySession {
    master: PtyMaster,
    slave_path: PathBuf,
}

impl PtySession {
    /// Allocate a new pty pair.
    ///
    /// Opens the master read/write without making it our controlling
    /// terminal, then resolves the slave name, grants and unlocks it, in
    /// that order. The master is close-on-exec so the shell never holds it.
    pub fn allocate() -> Result<Self, PtyError> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::Open)?;
        let slave_path = slave_name(&master).map_err(PtyError::SlaveName)?;

        grantpt(&master).map_err(PtyError::Grant)?;
        unlockpt(&master).map_err(PtyError::Unlock)?;

        fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(PtyError::CloseOnExec)?;

        log::info!("pty[{}], name[{slave_path}]", master.as_raw_fd());

        Ok(Self {
            master,
            slave_path: PathBuf::from(slave_path),
        })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Raw descriptor of the master end.
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Give up the session, keeping the master end as an owned file.
    ///
    /// Dropping the returned file closes the master and releases the pair.
    pub fn into_master(self) -> File {
        let fd = self.master.into_raw_fd();
        // SAFETY: `into_raw_fd` transfers sole ownership of a valid open fd.
        File::from(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

/// Allocate a new pty pair. See [`PtySession::allocate`].
pub fn allocate() -> Result<PtySession, PtyError> {
    PtySession::allocate()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    // SAFETY: single-threaded during setup; the static buffer is copied
    // into the returned String before anything else calls ptsname.
    unsafe { nix::pty::ptsname(master) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::{Read, Write};

    #[test]
    fn test_allocate_pty() {
        let pty = PtySession::allocate();
        assert!(pty.is_ok(), "Failed to allocate pty: {:?}", pty.err());
        let pty = pty.unwrap();

        assert!(pty.master_fd() >= 0);
        assert!(
            pty.slave_path().starts_with("/dev/"),
            "Unexpected slave path: {}",
            pty.slave_path().display()
        );
    }

    #[test]
    fn test_master_is_close_on_exec() {
        let pty = PtySession::allocate().unwrap();
        let flags = fcntl(pty.master_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_slave_is_unlocked() {
        let pty = PtySession::allocate().unwrap();
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .open(pty.slave_path());
        assert!(slave.is_ok(), "Slave should open after unlock: {:?}", slave.err());
    }

    #[test]
    fn test_slave_write_reaches_master() {
        let pty = PtySession::allocate().unwrap();
        let mut slave = OpenOptions::new()
            .read(true)
            .write(true)
            .open(pty.slave_path())
            .unwrap();
        let mut master = pty.into_master();

        slave.write_all(b"PTY_OK").unwrap();

        let mut buf = [0u8; 64];
        let n = master.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("PTY_OK"), "Unexpected master output: {text}");
    }

    #[test]
    fn test_distinct_allocations() {
        let a = PtySession::allocate().unwrap();
        let b = PtySession::allocate().unwrap();
        assert_ne!(a.slave_path(), b.slave_path());
    }
}
