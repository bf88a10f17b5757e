//! The shell process on the far side of the pty.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Errors from launching the child shell.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("fork: {0}")]
    Fork(#[source] Errno),

    #[error("path contains a NUL byte: {0}")]
    InvalidPath(String),
}

/// Errors from observing or signalling the child.
#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("waitpid failed for pid {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("failed to kill pid {pid}: {source}")]
    Kill {
        pid: Pid,
        #[source]
        source: Errno,
    },
}

/// How the child left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Exited normally with the given status.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Already reaped by someone else; status unknown.
    Vanished,
}

impl ChildExit {
    /// Exit code if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// A forked child process owned by this process.
///
/// Dropping a child that has not been reaped kills and reaps it, so an
/// early error return never leaves a shell behind.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    exit: Option<ChildExit>,
}

impl ChildProcess {
    /// Fork and exec `shell` with its standard streams on the pty slave at
    /// `slave_path`.
    ///
    /// The shell gets `argv = [shell]` and our environment. In the child,
    /// failure to open the slave or to exec is reported on stderr and the
    /// child exits with status 1; it never returns here.
    pub fn launch(slave_path: &Path, shell: &Path) -> Result<Self, LaunchError> {
        let plan = ExecPlan::new(slave_path, shell)?;

        // SAFETY: the child branch only calls async-signal-safe functions
        // (open, dup2, close, execvp, write, _exit) on buffers built by
        // `ExecPlan` before the fork.
        match unsafe { fork() }.map_err(LaunchError::Fork)? {
            ForkResult::Child => plan.exec(),
            ForkResult::Parent { child } => {
                log::info!("launched {} as pid {child}", shell.display());
                Ok(Self {
                    pid: child,
                    exit: None,
                })
            }
        }
    }

    /// Take ownership of an already running child of this process.
    #[cfg(test)]
    pub(crate) fn adopt(pid: Pid) -> Self {
        Self { pid, exit: None }
    }

    /// Process id of the child.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Exit status, once the child has been reaped.
    pub fn exit(&self) -> Option<ChildExit> {
        self.exit
    }

    /// Reap the child if it has exited, without blocking.
    ///
    /// Returns `Ok(None)` while the child is still running. Once reaped the
    /// result is cached and returned by every later call.
    pub fn try_reap(&mut self) -> Result<Option<ChildExit>, ChildError> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }

        let exit = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => ChildExit::Exited(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => ChildExit::Signaled(signal),
            Ok(_) => return Ok(None),
            Err(Errno::EINTR) => return Ok(None),
            Err(Errno::ECHILD) => ChildExit::Vanished,
            Err(source) => {
                return Err(ChildError::Wait {
                    pid: self.pid,
                    source,
                })
            }
        };

        self.exit = Some(exit);
        Ok(Some(exit))
    }

    /// Forcibly terminate the child and reap it.
    ///
    /// A child that has already been reaped is left alone: its pid may have
    /// been recycled by then.
    pub fn kill(&mut self) -> Result<ChildExit, ChildError> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }

        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => {
                return Err(ChildError::Kill {
                    pid: self.pid,
                    source,
                })
            }
        }

        let exit = loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break ChildExit::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => break ChildExit::Signaled(signal),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break ChildExit::Vanished,
                Err(source) => {
                    return Err(ChildError::Wait {
                        pid: self.pid,
                        source,
                    })
                }
            }
        };

        self.exit = Some(exit);
        Ok(exit)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.exit.is_none() {
            if let Err(e) = self.kill() {
                log::warn!("failed to clean up child: {e}");
            }
        }
    }
}

/// Launch `shell` on the pty slave. See [`ChildProcess::launch`].
pub fn launch(slave_path: &Path, shell: &Path) -> Result<ChildProcess, LaunchError> {
    ChildProcess::launch(slave_path, shell)
}

/// Everything the child needs between `fork` and `execvp`, built before the
/// fork. The child branch must not allocate.
struct ExecPlan {
    slave: CString,
    // Owns the strings `argv` points into.
    _program: CString,
    argv: [*const libc::c_char; 2],
    open_failed: String,
    dup_failed: String,
    exec_failed: String,
}

impl ExecPlan {
    fn new(slave_path: &Path, shell: &Path) -> Result<Self, LaunchError> {
        let slave = path_to_cstring(slave_path)?;
        let program = path_to_cstring(shell)?;
        // CString's heap buffer does not move when the CString does.
        let argv = [program.as_ptr(), std::ptr::null()];

        Ok(Self {
            slave,
            _program: program,
            argv,
            open_failed: format!("rt: open {}: ", slave_path.display()),
            dup_failed: format!("rt: dup2 {}: ", slave_path.display()),
            exec_failed: format!("rt: execvp {}: ", shell.display()),
        })
    }

    /// Child side of the fork. Never returns.
    fn exec(&self) -> ! {
        // SAFETY: plain syscalls on a NUL-terminated path and our own fds.
        let slave_fd = unsafe { libc::open(self.slave.as_ptr(), libc::O_RDWR) };
        if slave_fd < 0 {
            report_and_exit(&self.open_failed, Errno::last());
        }

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            // SAFETY: dup2 atomically replaces `target`; no fd is leaked.
            if unsafe { libc::dup2(slave_fd, target) } < 0 {
                report_and_exit(&self.dup_failed, Errno::last());
            }
        }
        if slave_fd > libc::STDERR_FILENO {
            // SAFETY: the slave is now reachable through 0, 1 and 2.
            unsafe { libc::close(slave_fd) };
        }

        // SAFETY: `argv` is NULL-terminated and its strings live in `self`.
        unsafe { libc::execvp(self.argv[0], self.argv.as_ptr()) };
        report_and_exit(&self.exec_failed, Errno::last())
    }
}

fn report_and_exit(prefix: &str, err: Errno) -> ! {
    let desc = err.desc();
    // SAFETY: write and _exit are async-signal-safe; buffers are valid.
    unsafe {
        libc::write(libc::STDERR_FILENO, prefix.as_ptr().cast(), prefix.len());
        libc::write(libc::STDERR_FILENO, desc.as_ptr().cast(), desc.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::_exit(1)
    }
}

fn path_to_cstring(path: &Path) -> Result<CString, LaunchError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LaunchError::InvalidPath(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtySession;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for_exit(child: &mut ChildProcess) -> Option<ChildExit> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(exit) = child.try_reap().unwrap() {
                return Some(exit);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn test_launch_shell() {
        let pty = PtySession::allocate().unwrap();
        let child = ChildProcess::launch(pty.slave_path(), Path::new("/bin/sh"));
        assert!(child.is_ok(), "Failed to launch: {:?}", child.err());
        let mut child = child.unwrap();

        assert!(child.pid().as_raw() > 0);
        assert_eq!(child.try_reap().unwrap(), None);
    }

    #[test]
    fn test_shell_talks_through_pty() {
        let pty = PtySession::allocate().unwrap();
        let mut child = ChildProcess::launch(pty.slave_path(), Path::new("/bin/sh")).unwrap();
        let mut master = pty.into_master();

        master.write_all(b"echo RT_CHILD_OK; exit 0\n").unwrap();

        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match master.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
        }

        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("RT_CHILD_OK"), "Unexpected output: {text}");
        assert_eq!(wait_for_exit(&mut child), Some(ChildExit::Exited(0)));
    }

    #[test]
    fn test_exec_failure_exits_with_status_one() {
        let pty = PtySession::allocate().unwrap();
        let mut child =
            ChildProcess::launch(pty.slave_path(), Path::new("/nonexistent/shell")).unwrap();
        let mut master = pty.into_master();

        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match master.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
        }

        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("execvp"), "Expected exec error, got: {text}");
        assert_eq!(wait_for_exit(&mut child), Some(ChildExit::Exited(1)));
    }

    #[test]
    fn test_kill_running_child() {
        let pty = PtySession::allocate().unwrap();
        let mut child = ChildProcess::launch(pty.slave_path(), Path::new("/bin/sh")).unwrap();

        let exit = child.kill().unwrap();
        assert_eq!(exit, ChildExit::Signaled(Signal::SIGKILL));
        assert_eq!(child.try_reap().unwrap(), Some(exit));
    }

    #[test]
    fn test_kill_after_reap_is_noop() {
        let pty = PtySession::allocate().unwrap();
        let mut child = ChildProcess::launch(pty.slave_path(), Path::new("/bin/sh")).unwrap();
        let mut master = pty.into_master();
        master.write_all(b"exit 3\n").unwrap();

        let exit = wait_for_exit(&mut child);
        assert_eq!(exit, Some(ChildExit::Exited(3)));
        assert_eq!(child.kill().unwrap(), ChildExit::Exited(3));
    }

    #[test]
    fn test_drop_kills_unreaped_child() {
        let pty = PtySession::allocate().unwrap();
        let child = ChildProcess::launch(pty.slave_path(), Path::new("/bin/sh")).unwrap();
        let pid = child.pid();

        drop(child);

        // Reaped by drop, so the pid is no longer our child.
        assert_eq!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Err(Errno::ECHILD));
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(ChildExit::Exited(2).code(), Some(2));
        assert_eq!(ChildExit::Signaled(Signal::SIGKILL).code(), None);
        assert_eq!(ChildExit::Vanished.code(), None);
    }

    #[test]
    fn test_exec_plan_argv_is_null_terminated() {
        let plan = ExecPlan::new(Path::new("/dev/pts/9"), Path::new("/bin/sh")).unwrap();

        assert!(plan.argv[1].is_null());
        // SAFETY: argv[0] points into the plan's program string.
        let argv0 = unsafe { std::ffi::CStr::from_ptr(plan.argv[0]) };
        assert_eq!(argv0.to_str().unwrap(), "/bin/sh");
        assert_eq!(plan.slave.to_str().unwrap(), "/dev/pts/9");
    }

    #[test]
    fn test_exec_plan_messages_name_the_failing_step() {
        let plan = ExecPlan::new(Path::new("/dev/pts/9"), Path::new("/bin/sh")).unwrap();

        assert_eq!(plan.open_failed, "rt: open /dev/pts/9: ");
        assert_eq!(plan.dup_failed, "rt: dup2 /dev/pts/9: ");
        assert_eq!(plan.exec_failed, "rt: execvp /bin/sh: ");
    }

    #[test]
    fn test_launch_rejects_nul_in_shell_path() {
        use std::ffi::OsStr;

        let pty = PtySession::allocate().unwrap();
        let shell = Path::new(OsStr::from_bytes(b"/bin/\0sh"));
        let result = ChildProcess::launch(pty.slave_path(), shell);
        assert!(matches!(result, Err(LaunchError::InvalidPath(_))));
    }
}
