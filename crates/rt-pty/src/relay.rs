//! The relay loop: terminal input to the pty, pty output to the terminal
//! and the audit log.
//!
//! Everything runs on one thread. The only place the loop blocks is the
//! `poll(2)` in [`RelayState::wait`], which watches the terminal input, the
//! pty master and a `signalfd` for SIGCHLD. Child exit is therefore just
//! another wake source: the loop reaps without blocking at the top of every
//! iteration and stops as soon as the shell is gone.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{pthread_sigmask, signal, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use rt_audit::{AuditSink, LineAccumulator};

use crate::child::{ChildError, ChildExit, ChildProcess};
use crate::terminal::RawModeGuard;

/// Largest chunk moved per readable descriptor per wake.
pub const READ_CHUNK: usize = 1024;

/// Upper bound on how long the loop sleeps without re-checking the child.
pub const DEFAULT_EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Reads allowed when draining the master after the child has exited.
/// A grandchild still holding the slave could otherwise keep us here.
const MAX_DRAIN_READS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to block SIGCHLD: {0}")]
    SignalMask(#[source] Errno),

    #[error("failed to create signalfd: {0}")]
    SignalFd(#[source] Errno),

    #[error("poll failed: {0}")]
    Poll(#[source] Errno),

    #[error(transparent)]
    Child(#[from] ChildError),
}

/// Ignore SIGINT in this process.
///
/// Must be called after the child is launched: an ignored disposition
/// survives exec, and the shell needs its own SIGINT handling.
pub fn ignore_interrupts() -> Result<(), Errno> {
    // SAFETY: installs SIG_IGN; no handler code runs.
    unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }.map(drop)
}

/// Which wake sources fired in one `poll`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub input: bool,
    pub master: bool,
    pub child: bool,
}

/// Descriptors watched by the relay and the SIGCHLD wake source.
///
/// Creating the state blocks SIGCHLD on the calling thread so it is
/// delivered through the signalfd; dropping it restores the previous mask
/// and closes every descriptor it owns.
pub struct RelayState {
    input: Option<File>,
    master: File,
    master_open: bool,
    child_exit: SignalFd,
    saved_mask: SigSet,
}

impl RelayState {
    /// Watch `input` (the terminal) and `master` (the pty).
    pub fn new(input: File, master: File) -> Result<Self, RelayError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);

        let mut saved_mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut saved_mask))
            .map_err(RelayError::SignalMask)?;

        let child_exit =
            match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC) {
                Ok(fd) => fd,
                Err(e) => {
                    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&saved_mask), None);
                    return Err(RelayError::SignalFd(e));
                }
            };

        Ok(Self {
            input: Some(input),
            master,
            master_open: true,
            child_exit,
            saved_mask,
        })
    }

    /// Still forwarding terminal input?
    pub fn input_open(&self) -> bool {
        self.input.is_some()
    }

    /// Still reading the pty master?
    pub fn master_open(&self) -> bool {
        self.master_open
    }

    /// Block until a watched descriptor is readable, SIGCHLD arrives, or
    /// `timeout` passes. An interrupted wait reports nothing ready.
    pub fn wait(&self, timeout: Duration) -> Result<Readiness, RelayError> {
        let mut fds = Vec::with_capacity(3);
        let input_slot = self.input.as_ref().map(|input| {
            fds.push(PollFd::new(input.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });
        let master_slot = self.master_open.then(|| {
            fds.push(PollFd::new(self.master.as_fd(), PollFlags::POLLIN));
            fds.len() - 1
        });
        fds.push(PollFd::new(self.child_exit.as_fd(), PollFlags::POLLIN));
        let child_slot = fds.len() - 1;

        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Readiness::default()),
            Err(e) => return Err(RelayError::Poll(e)),
        }

        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let fired = |slot: Option<usize>| {
            slot.and_then(|i| fds[i].revents())
                .is_some_and(|ev| ev.intersects(readable))
        };

        Ok(Readiness {
            input: fired(input_slot),
            master: fired(master_slot),
            child: fired(Some(child_slot)),
        })
    }

    /// Consume pending SIGCHLD notifications.
    fn clear_child_wake(&mut self) {
        while let Ok(Some(_)) = self.child_exit.read_signal() {}
    }

    /// Is output waiting on the master right now?
    fn master_pending(&self) -> Result<bool, RelayError> {
        if !self.master_open {
            return Ok(false);
        }
        let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(RelayError::Poll(e)),
        }
    }
}

impl Drop for RelayState {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved_mask), None) {
            log::warn!("failed to restore signal mask: {e}");
        }
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes forwarded from the terminal to the pty.
    pub bytes_in: u64,
    /// Bytes forwarded from the pty to the terminal.
    pub bytes_out: u64,
    /// Audit records produced.
    pub records: u64,
}

/// Result of a completed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub exit: ChildExit,
    pub stats: RelayStats,
}

/// The running session: relays bytes until the child exits, then tears
/// everything down.
///
/// `run` consumes the loop, so a stopped loop cannot be resumed.
pub struct RelayLoop<W: Write, S: AuditSink> {
    state: RelayState,
    child: ChildProcess,
    output: W,
    sink: S,
    accumulator: LineAccumulator,
    terminal: Option<RawModeGuard>,
    exit_check_interval: Duration,
    stats: RelayStats,
}

impl<W: Write, S: AuditSink> RelayLoop<W, S> {
    /// Relay between `state`'s descriptors and `output`, recording the
    /// child's output lines into `sink`.
    pub fn new(state: RelayState, child: ChildProcess, output: W, sink: S) -> Self {
        Self {
            state,
            child,
            output,
            sink,
            accumulator: LineAccumulator::new(),
            terminal: None,
            exit_check_interval: DEFAULT_EXIT_CHECK_INTERVAL,
            stats: RelayStats::default(),
        }
    }

    /// Restore this terminal mode during teardown.
    pub fn with_terminal(mut self, guard: RawModeGuard) -> Self {
        self.terminal = Some(guard);
        self
    }

    /// Longest sleep between child liveness checks.
    pub fn with_exit_check_interval(mut self, interval: Duration) -> Self {
        self.exit_check_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Relay until the child exits, then shut down.
    pub fn run(mut self) -> Result<RelayOutcome, RelayError> {
        log::debug!("relay running for pid {}", self.child.pid());

        let exit = loop {
            if let Some(exit) = self.child.try_reap()? {
                break exit;
            }

            let ready = self.state.wait(self.exit_check_interval)?;
            if ready.child {
                self.state.clear_child_wake();
            }
            if ready.input {
                self.forward_input();
            }
            if ready.master {
                self.forward_output();
            }
        };

        log::info!("child {} exited: {exit:?}", self.child.pid());
        self.shutdown(exit)
    }

    /// Terminal input goes to the pty unchanged.
    fn forward_input(&mut self) {
        let Some(input) = self.state.input.as_mut() else {
            return;
        };

        let mut buf = [0u8; READ_CHUNK];
        match input.read(&mut buf) {
            Ok(0) => {
                log::debug!("terminal input closed");
                self.state.input = None;
            }
            Ok(n) => match self.state.master.write_all(&buf[..n]) {
                Ok(()) => self.stats.bytes_in += n as u64,
                Err(e) => log::debug!("dropping {n} input bytes: {e}"),
            },
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                log::warn!("terminal input failed, no longer forwarding: {e}");
                self.state.input = None;
            }
        }
    }

    /// Pty output goes to the terminal unchanged and through the line
    /// accumulator into the audit sink.
    fn forward_output(&mut self) {
        if !self.state.master_open {
            return;
        }

        let mut buf = [0u8; READ_CHUNK];
        match self.state.master.read(&mut buf) {
            Ok(0) => self.master_hangup("end of file"),
            Ok(n) => self.emit_output(&buf[..n]),
            // Linux reports a closed slave as EIO.
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => self.master_hangup("EIO"),
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                log::warn!("pty read failed: {e}");
                self.master_hangup("read error");
            }
        }
    }

    fn emit_output(&mut self, data: &[u8]) {
        if let Err(e) = self.output.write_all(data).and_then(|()| self.output.flush()) {
            log::warn!("terminal output failed: {e}");
        }
        self.stats.bytes_out += data.len() as u64;

        let sink = &mut self.sink;
        let records = &mut self.stats.records;
        self.accumulator.feed_all(data, |record| {
            sink.append(&record);
            *records += 1;
        });
    }

    fn master_hangup(&mut self, why: &str) {
        log::debug!("pty master hung up ({why})");
        self.state.master_open = false;
    }

    fn shutdown(mut self, exit: ChildExit) -> Result<RelayOutcome, RelayError> {
        // Output the shell wrote just before exiting is still in the pty.
        for _ in 0..MAX_DRAIN_READS {
            if !self.state.master_pending()? {
                break;
            }
            self.forward_output();
        }

        if let Some(record) = self.accumulator.finish() {
            self.sink.append(&record);
            self.stats.records += 1;
        }

        let RelayLoop {
            state,
            mut child,
            mut sink,
            terminal,
            stats,
            ..
        } = self;

        // Releases the signalfd and closes the master and input descriptors.
        drop(state);

        if let Err(e) = child.kill() {
            log::warn!("failed to terminate child: {e}");
        }

        if let Some(guard) = terminal {
            if let Err(e) = guard.restore() {
                log::warn!("failed to restore terminal mode: {e}");
            }
        }

        sink.close();

        log::debug!(
            "relay stopped: {} bytes in, {} bytes out, {} records",
            stats.bytes_in,
            stats.bytes_out,
            stats.records
        );
        Ok(RelayOutcome { exit, stats })
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    let ms = timeout.as_millis().clamp(1, u128::from(u16::MAX));
    PollTimeout::from(ms as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtySession;
    use rt_audit::MemorySink;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::process::Command;
    use std::time::Instant;

    const FAST_CHECK: Duration = Duration::from_millis(50);

    fn pipe_pair() -> (File, File) {
        let (reader, writer) = nix::unistd::pipe().unwrap();
        (File::from(reader), File::from(writer))
    }

    /// A socket pair standing in for the pty: one end is the "master" the
    /// relay owns, the other plays the shell.
    fn fake_master() -> (File, UnixStream) {
        let (master, shell) = UnixStream::pair().unwrap();
        (File::from(OwnedFd::from(master)), shell)
    }

    fn sleeper(seconds: &str) -> ChildProcess {
        let child = Command::new("sleep").arg(seconds).spawn().unwrap();
        ChildProcess::adopt(nix::unistd::Pid::from_raw(child.id() as i32))
    }

    #[test]
    fn test_input_reaches_master_unaltered() {
        let (input, mut input_writer) = pipe_pair();
        let (master, mut shell) = fake_master();
        input_writer.write_all(b"echo hi\n").unwrap();
        drop(input_writer);

        let mut output = Vec::new();
        let mut sink = MemorySink::new();
        let state = RelayState::new(input, master).unwrap();
        let outcome = RelayLoop::new(state, sleeper("0.3"), &mut output, &mut sink)
            .with_exit_check_interval(FAST_CHECK)
            .run()
            .unwrap();

        let mut received = Vec::new();
        shell.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"echo hi\n");
        assert_eq!(outcome.stats.bytes_in, 8);
        assert!(output.is_empty());
        assert!(sink.records().is_empty());
    }

    #[test]
    fn test_output_echoed_and_recorded() {
        let (input, _input_writer) = pipe_pair();
        let (master, mut shell) = fake_master();
        shell.write_all(b"hello\r\n\r\nworld\r\npartial").unwrap();

        let mut output = Vec::new();
        let mut sink = MemorySink::new();
        let state = RelayState::new(input, master).unwrap();
        let outcome = RelayLoop::new(state, sleeper("0.3"), &mut output, &mut sink)
            .with_exit_check_interval(FAST_CHECK)
            .run()
            .unwrap();

        assert_eq!(output, b"hello\r\n\r\nworld\r\npartial");
        assert_eq!(sink.records(), ["hello", "world", "partial"]);
        assert!(sink.is_closed());
        assert_eq!(outcome.stats.records, 3);
        assert_eq!(outcome.exit, ChildExit::Exited(0));
    }

    #[test]
    fn test_exit_detected_without_input() {
        let (input, _input_writer) = pipe_pair();
        let (master, mut shell) = fake_master();

        let mut sink = MemorySink::new();
        let state = RelayState::new(input, master).unwrap();
        let started = Instant::now();
        let outcome = RelayLoop::new(state, sleeper("0.2"), io::sink(), &mut sink)
            .with_exit_check_interval(FAST_CHECK)
            .run()
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.exit, ChildExit::Exited(0));
        assert!(sink.is_closed());

        // The master was closed during teardown.
        let mut rest = Vec::new();
        assert_eq!(shell.read_to_end(&mut rest).unwrap(), 0);
    }

    /// Runs the relay in a forked, single-threaded copy of the test binary.
    /// Other harness threads leave SIGCHLD unblocked and would swallow it.
    fn relay_exit_wakes_in_isolation() -> bool {
        let (input, _input_writer) = pipe_pair();
        let (master, _shell) = fake_master();

        // Only the SIGCHLD wake source can end the wait within the bound.
        let mut sink = MemorySink::new();
        let state = RelayState::new(input, master).unwrap();
        let started = Instant::now();
        let outcome = RelayLoop::new(state, sleeper("0.2"), io::sink(), &mut sink)
            .with_exit_check_interval(Duration::from_secs(30))
            .run()
            .unwrap();

        started.elapsed() < Duration::from_secs(2)
            && outcome.exit == ChildExit::Exited(0)
            && sink.is_closed()
    }

    #[test]
    fn test_child_exit_wakes_poll() {
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let woke = std::panic::catch_unwind(relay_exit_wakes_in_isolation)
                    .unwrap_or(false);
                unsafe { nix::libc::_exit(if woke { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => {
                let deadline = Instant::now() + Duration::from_secs(10);
                let status = loop {
                    match waitpid(child, Some(WaitPidFlag::WNOHANG)).unwrap() {
                        WaitStatus::StillAlive if Instant::now() < deadline => {
                            std::thread::sleep(Duration::from_millis(20));
                        }
                        WaitStatus::StillAlive => {
                            let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
                            let _ = waitpid(child, None);
                            panic!("relay did not notice the child exit");
                        }
                        status => break status,
                    }
                };
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }

    #[test]
    fn test_signal_mask_restored() {
        let (input, _input_writer) = pipe_pair();
        let (master, _shell) = fake_master();

        let before = SigSet::thread_get_mask().unwrap().contains(Signal::SIGCHLD);
        let state = RelayState::new(input, master).unwrap();
        assert!(SigSet::thread_get_mask().unwrap().contains(Signal::SIGCHLD));
        drop(state);

        assert_eq!(
            SigSet::thread_get_mask().unwrap().contains(Signal::SIGCHLD),
            before
        );
    }

    #[test]
    fn test_wait_reports_readable_input() {
        let (input, mut input_writer) = pipe_pair();
        let (master, _shell) = fake_master();
        let state = RelayState::new(input, master).unwrap();

        let idle = state.wait(Duration::from_millis(10)).unwrap();
        assert!(!idle.input && !idle.master);

        input_writer.write_all(b"x").unwrap();
        let ready = state.wait(Duration::from_secs(1)).unwrap();
        assert!(ready.input);
        assert!(!ready.master);
    }

    #[test]
    fn test_shell_session_end_to_end() {
        let pty = PtySession::allocate().unwrap();
        let child = ChildProcess::launch(pty.slave_path(), Path::new("/bin/sh")).unwrap();
        let (input, mut input_writer) = pipe_pair();
        input_writer
            .write_all(b"echo RT_$((40+2))_OK\nexit 0\n")
            .unwrap();
        drop(input_writer);

        let mut output = Vec::new();
        let mut sink = MemorySink::new();
        let state = RelayState::new(input, pty.into_master()).unwrap();
        let outcome = RelayLoop::new(state, child, &mut output, &mut sink)
            .with_exit_check_interval(FAST_CHECK)
            .run()
            .unwrap();

        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("RT_42_OK"), "Unexpected output: {text}");
        assert!(
            sink.records().iter().any(|r| r.contains("RT_42_OK")),
            "Unexpected records: {:?}",
            sink.records()
        );
        assert!(sink.records().iter().all(|r| !r.is_empty()));
        assert_eq!(outcome.exit, ChildExit::Exited(0));
    }

    #[test]
    fn test_poll_timeout_clamped() {
        assert_eq!(poll_timeout(Duration::ZERO), PollTimeout::from(1u16));
        assert_eq!(poll_timeout(Duration::from_millis(250)), PollTimeout::from(250u16));
        assert_eq!(poll_timeout(Duration::from_secs(3600)), PollTimeout::from(u16::MAX));
    }
}
